//! In-crate fake runtime for unit tests

use crate::backend::HardwareBackend;
use crate::config::EngineConfiguration;
use crate::generation::Token;
use crate::runtime::{InferenceRuntime, RuntimeError};
use crate::sampling::{Sampler, SamplingParams};
use crate::session::{InferenceSession, StopSignal};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Index 0 is end-of-sequence
const VOCAB: [&str; 8] = ["</s>", " the", " cat", " sat", " on", " a", " mat", "."];

#[derive(Default)]
pub(crate) struct FakeRuntime {
    pub loads: AtomicUsize,
    pub warm_ups: AtomicUsize,
    pub prefills: AtomicUsize,
    pub samples: AtomicUsize,
    pub resets: AtomicUsize,
    pub frees: AtomicUsize,
    /// Emit end-of-sequence once this many fragments were produced (0 = never)
    pub eos_after: usize,
    pub fail_warm_up: bool,
    pub unsupported: Vec<HardwareBackend>,
    /// Largest accepted context size (0 = unlimited)
    pub max_context: u32,
    /// Decode a BOS position before the first draw with nothing to condition on
    pub bos_when_unprimed: bool,
    /// Keep the context position to itself
    pub hide_usage: bool,
    pub stop_on_sample: Mutex<Option<StopSignal>>,
}

pub(crate) struct FakeHandle {
    sampler: Sampler,
    history: Vec<usize>,
    generated: usize,
    context_size: usize,
    used: usize,
    primed: bool,
}

impl FakeHandle {
    fn occupy(&mut self, positions: usize) -> Result<(), RuntimeError> {
        let available = self.context_size - self.used;
        if positions > available {
            return Err(RuntimeError::ContextOverflow {
                requested: positions,
                available,
            });
        }
        self.used += positions;
        Ok(())
    }
}

impl FakeRuntime {
    /// Fire `signal` from inside the next `sample_one_token` call
    pub fn stop_during_sample(&self, signal: StopSignal) {
        if let Ok(mut slot) = self.stop_on_sample.lock() {
            *slot = Some(signal);
        }
    }

    fn logits(handle: &FakeHandle, eos_after: usize) -> Vec<f32> {
        let step = handle.history.len();
        let mut logits: Vec<f32> = (0..VOCAB.len())
            .map(|id| ((id * 7 + step * 3) % 11) as f32 / 2.0)
            .collect();
        logits[0] = if eos_after > 0 && handle.generated >= eos_after {
            100.0
        } else {
            -100.0
        };
        logits
    }
}

impl InferenceRuntime for FakeRuntime {
    type Handle = FakeHandle;

    fn supports(&self, backend: HardwareBackend) -> bool {
        !self.unsupported.contains(&backend)
    }

    fn load(&self, config: &EngineConfiguration) -> Result<FakeHandle, RuntimeError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.max_context > 0 && config.context_size > self.max_context {
            return Err(RuntimeError::Unsupported(format!(
                "context size {} exceeds {}",
                config.context_size, self.max_context
            )));
        }
        Ok(FakeHandle {
            sampler: Sampler::new(SamplingParams::default()),
            history: Vec::new(),
            generated: 0,
            context_size: config.context_size as usize,
            used: 0,
            primed: false,
        })
    }

    fn warm_up(&self, _handle: &mut FakeHandle) -> Result<(), RuntimeError> {
        self.warm_ups.fetch_add(1, Ordering::SeqCst);
        if self.fail_warm_up {
            return Err(RuntimeError::Decode("warm-up batch rejected".into()));
        }
        Ok(())
    }

    fn prefill(&self, handle: &mut FakeHandle, text: &str) -> Result<usize, RuntimeError> {
        self.prefills.fetch_add(1, Ordering::SeqCst);
        let words: Vec<&str> = text.split_whitespace().collect();
        handle.occupy(words.len())?;
        for word in &words {
            handle.history.push(1 + word.len() % (VOCAB.len() - 1));
        }
        handle.primed |= !words.is_empty();
        Ok(words.len())
    }

    fn sample_one_token(
        &self,
        handle: &mut FakeHandle,
        params: &SamplingParams,
    ) -> Result<Token, RuntimeError> {
        self.samples.fetch_add(1, Ordering::SeqCst);
        if let Some(signal) = self.stop_on_sample.lock().ok().and_then(|mut s| s.take()) {
            signal.request_stop();
        }

        if self.bos_when_unprimed && !handle.primed {
            handle.occupy(1)?;
            handle.primed = true;
        }

        let logits = Self::logits(handle, self.eos_after);
        handle.sampler.configure(params);
        let id = handle.sampler.sample(&logits, &handle.history)?;

        // End-of-sequence is never decoded, so it takes no position
        if id == 0 {
            return Ok(Token::EndOfSequence);
        }
        handle.occupy(1)?;
        handle.history.push(id);
        handle.generated += 1;
        Ok(Token::Fragment(VOCAB[id].to_string()))
    }

    fn reset_cache(&self, handle: &mut FakeHandle) -> Result<(), RuntimeError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        handle.history.clear();
        handle.generated = 0;
        handle.used = 0;
        handle.primed = false;
        handle.sampler.reset();
        Ok(())
    }

    fn context_used(&self, handle: &FakeHandle) -> Option<usize> {
        (!self.hide_usage).then_some(handle.used)
    }

    fn free(&self, _handle: FakeHandle) {
        self.frees.fetch_add(1, Ordering::SeqCst);
    }
}

/// Open a CPU session on `fake` with default configuration
pub(crate) fn open_fake(
    fake: FakeRuntime,
) -> (Arc<FakeRuntime>, InferenceSession<FakeRuntime>, TempDir) {
    open_fake_with(fake, |config| config)
}

/// Like [`open_fake`], with the configuration adjusted by `configure`
pub(crate) fn open_fake_with(
    fake: FakeRuntime,
    configure: impl FnOnce(EngineConfiguration) -> EngineConfiguration,
) -> (Arc<FakeRuntime>, InferenceSession<FakeRuntime>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(fake);
    let config = configure(EngineConfiguration::new(dir.path()));
    let session = InferenceSession::open(runtime.clone(), config).unwrap();
    (runtime, session, dir)
}
