//! llama.cpp runtime implementation
//!
//! This module encapsulates all llama.cpp-specific logic. The session state
//! machine in `engine-core` only sees it through [`InferenceRuntime`].

use engine_core::sampling::{Sampler, SamplingParams};
use engine_core::{
    CapabilityReport, EngineConfiguration, HardwareBackend, InferenceRuntime, KvCachePrecision,
    RuntimeError, Token,
};
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;
use std::fs::OpenOptions;
use std::io;
use std::num::NonZeroU32;
use std::os::fd::{AsRawFd, RawFd};
use tracing::{debug, info, warn};

/// Byte-level tokens drawn in one step while completing a UTF-8 character
const MAX_PIECE_TOKENS: usize = 8;

/// llama.cpp runtime.
///
/// Owns the process-wide llama.cpp backend, which can be initialized only once,
/// so a process should build a single runtime and share it.
pub struct LlamaCppRuntime {
    backend: LlamaBackend,
    capabilities: CapabilityReport,
}

/// One loaded model and its context
pub struct LlamaHandle {
    // Declared before `model` so it is dropped first
    context: LlamaContext<'static>,
    model: Box<LlamaModel>,
    batch: LlamaBatch,
    batch_size: usize,
    context_size: usize,
    backend: HardwareBackend,
    /// Next KV cache position
    position: i32,
    /// Whether the last decode produced logits to sample from
    logits_ready: bool,
    sampler: Sampler,
    history: Vec<usize>,
    /// Bytes of a character split across tokens
    pending: Vec<u8>,
    /// End-of-generation was drawn while `pending` still had bytes to flush
    ended: bool,
}

impl LlamaCppRuntime {
    pub fn new(capabilities: CapabilityReport) -> Result<Self, RuntimeError> {
        let backend = LlamaBackend::init()
            .map_err(|err| RuntimeError::Load(format!("failed to initialize llama.cpp: {err}")))?;
        Ok(Self {
            backend,
            capabilities,
        })
    }
}

impl InferenceRuntime for LlamaCppRuntime {
    type Handle = LlamaHandle;

    fn supports(&self, backend: HardwareBackend) -> bool {
        match backend {
            HardwareBackend::Cpu => true,
            HardwareBackend::MetalGpu => cfg!(feature = "metal") && self.capabilities.supports(backend),
            HardwareBackend::VulkanGpu => {
                cfg!(feature = "vulkan") && self.capabilities.supports(backend)
            }
            HardwareBackend::OpenclGpu
            | HardwareBackend::NpuHexagon
            | HardwareBackend::NpuMediatek => false,
        }
    }

    fn load(&self, config: &EngineConfiguration) -> Result<LlamaHandle, RuntimeError> {
        if !self.supports(config.backend) {
            return Err(RuntimeError::Unsupported(format!(
                "llama.cpp was not built for the {} backend",
                config.backend
            )));
        }
        if config.kv_cache_precision != KvCachePrecision::F16 {
            return Err(RuntimeError::Unsupported(format!(
                "kv cache precision {} (only f16 is supported)",
                config.kv_cache_precision
            )));
        }
        let threads = i32::try_from(config.threads)
            .map_err(|_| RuntimeError::Unsupported(format!("{} threads", config.threads)))?;

        let model_params =
            LlamaModelParams::default().with_n_gpu_layers(config.effective_gpu_layers());
        let model = Box::new(
            LlamaModel::load_from_file(&self.backend, &config.model_path, &model_params)
                .map_err(|err| RuntimeError::Load(err.to_string()))?,
        );

        let context_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(config.context_size))
            .with_n_batch(config.batch_size)
            .with_n_threads(threads)
            .with_n_threads_batch(threads)
            .with_flash_attention(config.use_flash_attention);

        let context = model
            .new_context(&self.backend, context_params)
            .map_err(|err| RuntimeError::Load(format!("failed to create context: {err}")))?;

        // SAFETY: the model is boxed, so its address is stable, and it lives in
        // the same handle as the context. Field order drops the context first.
        let context = unsafe { std::mem::transmute::<LlamaContext<'_>, LlamaContext<'static>>(context) };

        info!(
            model = %config.model_path.display(),
            gpu_layers = config.effective_gpu_layers(),
            "llama.cpp model loaded"
        );

        Ok(LlamaHandle {
            context,
            model,
            batch: LlamaBatch::new(config.batch_size as usize, 1),
            batch_size: config.batch_size as usize,
            context_size: config.context_size as usize,
            backend: config.backend,
            position: 0,
            logits_ready: false,
            sampler: Sampler::new(SamplingParams::default()),
            history: Vec::new(),
            pending: Vec::new(),
            ended: false,
        })
    }

    fn warm_up(&self, handle: &mut LlamaHandle) -> Result<(), RuntimeError> {
        // Metal compiles its shaders on the first decode and logs each one
        let _quiet = if handle.backend == HardwareBackend::MetalGpu {
            match suppress_stderr() {
                Ok(guard) => Some(guard),
                Err(err) => {
                    warn!(error = %err, "could not silence stderr during warm-up");
                    None
                }
            }
        } else {
            None
        };

        let bos = handle.model.token_bos();
        handle.decode_one(bos)?;
        handle.clear();
        debug!("warm-up decode complete");
        Ok(())
    }

    fn prefill(&self, handle: &mut LlamaHandle, text: &str) -> Result<usize, RuntimeError> {
        let add_bos = if handle.position == 0 {
            AddBos::Always
        } else {
            AddBos::Never
        };
        let tokens = handle
            .model
            .str_to_token(text, add_bos)
            .map_err(|err| RuntimeError::Tokenize(err.to_string()))?;
        if tokens.is_empty() {
            return Ok(0);
        }

        let available = handle.available();
        if tokens.len() > available {
            return Err(RuntimeError::ContextOverflow {
                requested: tokens.len(),
                available,
            });
        }

        // Only the final prompt token needs logits
        let last = tokens.len() - 1;
        for (chunk_index, chunk) in tokens.chunks(handle.batch_size).enumerate() {
            handle.batch.clear();
            for (offset, token) in chunk.iter().enumerate() {
                let index = chunk_index * handle.batch_size + offset;
                handle
                    .batch
                    .add(*token, handle.position + index as i32, &[0], index == last)
                    .map_err(|err| RuntimeError::Decode(err.to_string()))?;
            }
            handle
                .context
                .decode(&mut handle.batch)
                .map_err(|err| RuntimeError::Decode(err.to_string()))?;
        }

        handle.position += tokens.len() as i32;
        handle.logits_ready = true;
        handle
            .history
            .extend(tokens.iter().map(|token| token.0 as usize));

        debug!(
            tokens = tokens.len(),
            position = handle.position,
            "prompt decoded"
        );
        Ok(tokens.len())
    }

    fn sample_one_token(
        &self,
        handle: &mut LlamaHandle,
        params: &SamplingParams,
    ) -> Result<Token, RuntimeError> {
        if std::mem::take(&mut handle.ended) {
            return Ok(Token::EndOfSequence);
        }
        // After a reset there is nothing to condition on but BOS
        if !handle.logits_ready {
            let bos = handle.model.token_bos();
            handle.decode_one(bos)?;
        }
        handle.sampler.configure(params);

        for _ in 0..MAX_PIECE_TOKENS {
            let logits: Vec<f32> = handle.context.candidates().map(|data| data.logit()).collect();
            let id = handle.sampler.sample(&logits, &handle.history)?;
            let token = LlamaToken::new(
                i32::try_from(id).map_err(|_| RuntimeError::Decode(format!("token id {id}")))?,
            );

            if handle.model.is_eog_token(token) {
                return Ok(match flush_pending(&mut handle.pending) {
                    Some(text) => {
                        handle.ended = true;
                        Token::Fragment(text)
                    }
                    None => Token::EndOfSequence,
                });
            }

            let bytes = handle
                .model
                .token_to_bytes(token, Special::Tokenize)
                .map_err(|err| RuntimeError::Decode(err.to_string()))?;
            handle.decode_one(token)?;
            handle.history.push(id);
            handle.pending.extend_from_slice(&bytes);

            if let Some(text) = take_complete_utf8(&mut handle.pending) {
                return Ok(Token::Fragment(text));
            }
        }

        flush_pending(&mut handle.pending)
            .map(Token::Fragment)
            .ok_or_else(|| RuntimeError::Decode("model produced no printable output".into()))
    }

    fn reset_cache(&self, handle: &mut LlamaHandle) -> Result<(), RuntimeError> {
        handle.clear();
        handle.sampler.reset();
        Ok(())
    }

    fn context_used(&self, handle: &LlamaHandle) -> Option<usize> {
        Some(handle.position as usize)
    }

    fn free(&self, handle: LlamaHandle) {
        drop(handle);
        debug!("llama.cpp context freed");
    }
}

impl LlamaHandle {
    fn available(&self) -> usize {
        self.context_size.saturating_sub(self.position as usize)
    }

    /// Decode a single token at the next position, requesting its logits
    fn decode_one(&mut self, token: LlamaToken) -> Result<(), RuntimeError> {
        if self.available() == 0 {
            return Err(RuntimeError::ContextOverflow {
                requested: 1,
                available: 0,
            });
        }
        self.batch.clear();
        self.batch
            .add(token, self.position, &[0], true)
            .map_err(|err| RuntimeError::Decode(err.to_string()))?;
        self.context
            .decode(&mut self.batch)
            .map_err(|err| RuntimeError::Decode(err.to_string()))?;
        self.position += 1;
        self.logits_ready = true;
        Ok(())
    }

    fn clear(&mut self) {
        self.context.clear_kv_cache();
        self.position = 0;
        self.logits_ready = false;
        self.history.clear();
        self.pending.clear();
        self.ended = false;
    }
}

/// Split off the longest prefix of `pending` made of whole characters.
///
/// Invalid sequences are replaced rather than held back forever.
fn take_complete_utf8(pending: &mut Vec<u8>) -> Option<String> {
    match std::str::from_utf8(pending) {
        Ok("") => None,
        Ok(text) => {
            let text = text.to_owned();
            pending.clear();
            Some(text)
        }
        Err(err) if err.error_len().is_some() => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            Some(text)
        }
        Err(err) => {
            let valid = err.valid_up_to();
            if valid == 0 {
                return None;
            }
            let rest = pending.split_off(valid);
            let complete = std::mem::replace(pending, rest);
            String::from_utf8(complete).ok()
        }
    }
}

/// Whatever is left in `pending`, lossily decoded
fn flush_pending(pending: &mut Vec<u8>) -> Option<String> {
    if pending.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(&std::mem::take(pending)).into_owned())
}

/// Redirects stderr to /dev/null until dropped
struct StderrGuard {
    saved: RawFd,
}

impl Drop for StderrGuard {
    fn drop(&mut self) {
        // SAFETY: `saved` is the descriptor duplicated in `suppress_stderr` and
        // is closed only here.
        unsafe {
            libc::dup2(self.saved, libc::STDERR_FILENO);
            libc::close(self.saved);
        }
    }
}

fn suppress_stderr() -> io::Result<StderrGuard> {
    let devnull = OpenOptions::new().write(true).open("/dev/null")?;

    // SAFETY: plain descriptor calls on fds owned by this process
    unsafe {
        let saved = libc::dup(libc::STDERR_FILENO);
        if saved < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::dup2(devnull.as_raw_fd(), libc::STDERR_FILENO) < 0 {
            let err = io::Error::last_os_error();
            libc::close(saved);
            return Err(err);
        }
        Ok(StderrGuard { saved })
    }
}
