#[cfg(feature = "llama-cpp")]
mod llama_cpp_runtime;
mod logging;
mod probe;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use engine_core::{
    CapabilityReport, EngineConfiguration, EngineError, EngineHost, GenerationRequest,
    HardwareBackend, InferenceRuntime, KvCachePrecision, RuntimeError, SessionHandle, StopSignal,
    Token,
};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Local LLM inference engine", long_about = None)]
struct Cli {
    /// Verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report which hardware backends can be used on this machine
    Probe {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate a completion for one prompt
    Run {
        #[command(flatten)]
        session: SessionArgs,

        #[command(flatten)]
        sampling: SamplingArgs,

        /// The prompt to complete
        #[arg(short, long)]
        prompt: String,

        /// Stop generation after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Interactive line-by-line session (/reset clears the context, /quit exits)
    Chat {
        #[command(flatten)]
        session: SessionArgs,

        #[command(flatten)]
        sampling: SamplingArgs,
    },
}

#[derive(Args, Debug, Default)]
struct SessionArgs {
    /// YAML or JSON engine configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the GGUF model file
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// cpu, vulkan, opencl, metal, hexagon, mediatek or auto
    #[arg(short, long)]
    backend: Option<BackendChoice>,

    #[arg(long)]
    gpu_layers: Option<u32>,

    #[arg(long)]
    context_size: Option<u32>,

    #[arg(long)]
    batch_size: Option<u32>,

    #[arg(short, long)]
    threads: Option<u32>,

    #[arg(long)]
    no_flash_attention: bool,

    /// f32, f16, q8_0 or q4_0
    #[arg(long)]
    kv_cache: Option<KvCachePrecision>,
}

#[derive(Args, Debug)]
struct SamplingArgs {
    /// Number of tokens to generate per reply
    #[arg(short = 'n', long, default_value = "256")]
    max_tokens: u32,

    #[arg(long, default_value = "0.7")]
    temperature: f32,

    #[arg(long, default_value = "0.95")]
    top_p: f32,

    /// 0 disables top-k
    #[arg(long, default_value = "40")]
    top_k: u32,

    #[arg(long, default_value = "1.1")]
    repeat_penalty: f32,

    #[arg(long, default_value = "42")]
    seed: u64,
}

impl SamplingArgs {
    fn request(&self) -> Result<GenerationRequest> {
        let request = GenerationRequest::new(self.max_tokens)
            .with_temperature(self.temperature)
            .with_top_p(self.top_p)
            .with_top_k(self.top_k)
            .with_repeat_penalty(self.repeat_penalty)
            .with_seed(self.seed);
        request.validate()?;
        Ok(request)
    }
}

/// Backend selection on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendChoice {
    /// Best backend the capability report allows
    Auto,
    Fixed(HardwareBackend),
}

impl FromStr for BackendChoice {
    type Err = engine_core::UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            Ok(Self::Auto)
        } else {
            s.parse().map(Self::Fixed)
        }
    }
}

/// Merge the config file, the flags and the capability report
fn build_config(args: &SessionArgs, report: &CapabilityReport) -> Result<EngineConfiguration> {
    let mut config = match (&args.config, &args.model) {
        (Some(path), model) => {
            let mut config = EngineConfiguration::from_path(path)
                .with_context(|| format!("failed to load config {}", path.display()))?;
            if let Some(model) = model {
                config.model_path = model.clone();
            }
            config
        }
        (None, Some(model)) => EngineConfiguration::new(model),
        (None, None) => bail!("either --model or --config is required"),
    };

    if let Some(gpu_layers) = args.gpu_layers {
        config = config.with_gpu_layers(gpu_layers);
    }
    if let Some(context_size) = args.context_size {
        config = config.with_context_size(context_size);
    }
    if let Some(batch_size) = args.batch_size {
        config = config.with_batch_size(batch_size);
    }
    if let Some(threads) = args.threads {
        config = config.with_threads(threads);
    }
    if args.no_flash_attention {
        config = config.with_flash_attention(false);
    }
    if let Some(precision) = args.kv_cache {
        config = config.with_kv_cache_precision(precision);
    }

    let backend = match args.backend {
        Some(BackendChoice::Auto) => report.preferred(),
        Some(BackendChoice::Fixed(backend)) => report.resolve(backend),
        None => report.resolve(config.backend),
    };
    config = config.with_backend(backend);

    config.validate().context("invalid engine configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Commands::Probe { json } => {
            let report = probe::system_prober().report();
            let mut stdout = io::stdout().lock();
            print_report(&report, json, &mut stdout)
        }
        Commands::Run {
            session,
            sampling,
            prompt,
            timeout_ms,
        } => {
            let request = sampling.request()?;
            let report = probe::system_prober().report();
            let config = build_config(&session, &report)?;
            let mut host = open_host(report)?;
            let handle = host
                .open(config)
                .context("failed to open inference session")?;
            let mut stdout = io::stdout().lock();
            run_prompt(
                &mut host,
                handle,
                &prompt,
                &request,
                timeout_ms.map(Duration::from_millis),
                &mut stdout,
            )?;
            host.release(handle);
            Ok(())
        }
        Commands::Chat { session, sampling } => {
            let request = sampling.request()?;
            let report = probe::system_prober().report();
            let config = build_config(&session, &report)?;
            let mut host = open_host(report)?;
            let handle = host
                .open(config)
                .context("failed to open inference session")?;
            let stdin = io::stdin().lock();
            let mut stdout = io::stdout().lock();
            chat_loop(&mut host, handle, &request, stdin, &mut stdout)?;
            host.release(handle);
            Ok(())
        }
    }
}

#[cfg(feature = "llama-cpp")]
fn open_host(report: CapabilityReport) -> Result<EngineHost<llama_cpp_runtime::LlamaCppRuntime>> {
    let runtime = llama_cpp_runtime::LlamaCppRuntime::new(report)
        .context("failed to initialize llama.cpp")?;
    Ok(EngineHost::new(runtime))
}

#[cfg(not(feature = "llama-cpp"))]
fn open_host(_report: CapabilityReport) -> Result<EngineHost<NoRuntime>> {
    bail!("engine-native was built without the llama-cpp feature")
}

/// Placeholder runtime type for builds without llama.cpp
#[cfg(not(feature = "llama-cpp"))]
enum NoRuntime {}

#[cfg(not(feature = "llama-cpp"))]
impl InferenceRuntime for NoRuntime {
    type Handle = std::convert::Infallible;

    fn supports(&self, _backend: HardwareBackend) -> bool {
        match *self {}
    }

    fn load(&self, _config: &EngineConfiguration) -> Result<Self::Handle, RuntimeError> {
        match *self {}
    }

    fn prefill(&self, handle: &mut Self::Handle, _text: &str) -> Result<usize, RuntimeError> {
        match *handle {}
    }

    fn sample_one_token(
        &self,
        handle: &mut Self::Handle,
        _params: &engine_core::SamplingParams,
    ) -> Result<Token, RuntimeError> {
        match *handle {}
    }

    fn reset_cache(&self, handle: &mut Self::Handle) -> Result<(), RuntimeError> {
        match *handle {}
    }

    fn free(&self, handle: Self::Handle) {
        match handle {}
    }
}

fn print_report(report: &CapabilityReport, json: bool, out: &mut impl Write) -> Result<()> {
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(report)?)?;
        return Ok(());
    }

    for backend in HardwareBackend::ALL {
        let status = if report.supports(backend) {
            "available"
        } else {
            "unavailable"
        };
        writeln!(out, "{:<10} {}", backend, status)?;
    }
    writeln!(out, "preferred: {}", report.preferred())?;
    Ok(())
}

/// Ingest `prompt` and stream the reply to `out`
fn run_prompt<R: InferenceRuntime>(
    host: &mut EngineHost<R>,
    handle: SessionHandle,
    prompt: &str,
    request: &GenerationRequest,
    timeout: Option<Duration>,
    out: &mut impl Write,
) -> Result<()> {
    let tokens = host.ingest_prompt(handle, prompt)?;
    info!(tokens, "prompt ingested");

    let stop = host
        .stop_signal(handle)
        .context("session closed before generation")?;
    let _watchdog = timeout.map(|timeout| spawn_watchdog(stop.clone(), timeout));

    let produced = stream_reply(host, handle, request, out)?;
    if stop.is_stop_requested() {
        warn!(produced, "generation stopped by timeout");
    }
    Ok(())
}

/// Call `request_stop` on `stop` unless the returned sender is dropped first
fn spawn_watchdog(stop: StopSignal, timeout: Duration) -> Sender<()> {
    let (done, finished) = mpsc::channel::<()>();
    thread::spawn(move || {
        if let Err(RecvTimeoutError::Timeout) = finished.recv_timeout(timeout) {
            stop.request_stop();
        }
    });
    done
}

/// Generate until end-of-sequence or `max_tokens`, writing each fragment as it arrives
fn stream_reply<R: InferenceRuntime>(
    host: &mut EngineHost<R>,
    handle: SessionHandle,
    request: &GenerationRequest,
    out: &mut impl Write,
) -> Result<usize> {
    let mut produced = 0;
    for _ in 0..request.max_tokens {
        match host.generate_next(handle, request)? {
            Token::Fragment(text) => {
                out.write_all(text.as_bytes())?;
                out.flush()?;
                produced += 1;
            }
            Token::EndOfSequence => break,
        }
    }
    writeln!(out)?;
    Ok(produced)
}

fn chat_loop<R: InferenceRuntime>(
    host: &mut EngineHost<R>,
    handle: SessionHandle,
    request: &GenerationRequest,
    input: impl BufRead,
    out: &mut impl Write,
) -> Result<()> {
    write!(out, "> ")?;
    out.flush()?;

    for line in input.lines() {
        let line = line?;
        match line.trim() {
            "" => {}
            "/quit" | "/exit" => break,
            "/reset" => {
                host.reset_context(handle)?;
                writeln!(out, "[context cleared]")?;
            }
            text => {
                let full = match host.ingest_prompt(handle, &format!("{text}\n")) {
                    Ok(_) => {
                        stream_reply(host, handle, request, out)?;
                        host.session(handle)
                            .is_some_and(|session| session.context_remaining() == 0)
                    }
                    Err(EngineError::Runtime(RuntimeError::ContextOverflow { .. })) => true,
                    Err(err) => return Err(err.into()),
                };
                if full {
                    writeln!(out, "[context full, use /reset]")?;
                }
            }
        }
        write!(out, "> ")?;
        out.flush()?;
    }
    Ok(())
}
