//! Deterministic runtime shared by the scenario tests

#![allow(dead_code)]

use engine_core::{
    EngineConfiguration, HardwareBackend, InferenceRuntime, RuntimeError, Sampler, SamplingParams,
    Token,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::NamedTempFile;

pub const VOCAB: [&str; 12] = [
    "<eos>", "Hello", ",", " world", " from", " a", " tiny", " model", " that", " talks", "!", " é",
];

/// Runtime whose next-token distribution depends only on the token history
#[derive(Default)]
pub struct ScriptedRuntime {
    pub loads: AtomicUsize,
    pub prefills: AtomicUsize,
    pub samples: AtomicUsize,
    pub resets: AtomicUsize,
    pub frees: AtomicUsize,
    /// End the sequence after this many fragments
    pub eos_after: Option<usize>,
}

pub struct ScriptedHandle {
    sampler: Sampler,
    history: Vec<usize>,
    fragments: usize,
    used: usize,
    context_size: usize,
}

impl ScriptedRuntime {
    pub fn live_handles(&self) -> usize {
        self.loads.load(Ordering::SeqCst) - self.frees.load(Ordering::SeqCst)
    }

    fn logits(&self, handle: &ScriptedHandle) -> Vec<f32> {
        let last = handle.history.last().copied().unwrap_or(0);
        let mut logits: Vec<f32> = (0..VOCAB.len())
            .map(|id| ((id * 5 + last * 3 + handle.history.len()) % 13) as f32 / 3.0)
            .collect();
        let finished = self
            .eos_after
            .is_some_and(|limit| handle.fragments >= limit);
        logits[0] = if finished { 50.0 } else { f32::NEG_INFINITY };
        logits
    }
}

impl InferenceRuntime for ScriptedRuntime {
    type Handle = ScriptedHandle;

    fn supports(&self, backend: HardwareBackend) -> bool {
        backend == HardwareBackend::Cpu
    }

    fn load(&self, config: &EngineConfiguration) -> Result<ScriptedHandle, RuntimeError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedHandle {
            sampler: Sampler::new(SamplingParams::default()),
            history: Vec::new(),
            fragments: 0,
            used: 0,
            context_size: config.context_size as usize,
        })
    }

    fn prefill(&self, handle: &mut ScriptedHandle, text: &str) -> Result<usize, RuntimeError> {
        self.prefills.fetch_add(1, Ordering::SeqCst);
        let ids: Vec<usize> = text
            .split_whitespace()
            .map(|word| 1 + word.bytes().map(usize::from).sum::<usize>() % (VOCAB.len() - 1))
            .collect();
        if handle.used + ids.len() > handle.context_size {
            return Err(RuntimeError::ContextOverflow {
                requested: ids.len(),
                available: handle.context_size - handle.used,
            });
        }
        handle.used += ids.len();
        handle.history.extend(&ids);
        Ok(ids.len())
    }

    fn sample_one_token(
        &self,
        handle: &mut ScriptedHandle,
        params: &SamplingParams,
    ) -> Result<Token, RuntimeError> {
        self.samples.fetch_add(1, Ordering::SeqCst);
        let logits = self.logits(handle);
        handle.sampler.configure(params);
        let id = handle.sampler.sample(&logits, &handle.history)?;
        if id == 0 {
            return Ok(Token::EndOfSequence);
        }
        handle.used += 1;
        handle.history.push(id);
        handle.fragments += 1;
        Ok(Token::Fragment(VOCAB[id].to_string()))
    }

    fn reset_cache(&self, handle: &mut ScriptedHandle) -> Result<(), RuntimeError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        handle.history.clear();
        handle.fragments = 0;
        handle.used = 0;
        handle.sampler.reset();
        Ok(())
    }

    fn free(&self, _handle: ScriptedHandle) {
        self.frees.fetch_add(1, Ordering::SeqCst);
    }
}

/// An empty file standing in for a model
pub fn model_file() -> NamedTempFile {
    tempfile::Builder::new()
        .prefix("model-")
        .suffix(".gguf")
        .tempfile()
        .unwrap()
}

/// The reference configuration: CPU, 4096-token context, 512-token batches
pub fn cpu_config(model: &NamedTempFile) -> EngineConfiguration {
    EngineConfiguration::new(model.path())
        .with_backend(HardwareBackend::Cpu)
        .with_context_size(4096)
        .with_batch_size(512)
}
