//! End-to-end session protocol tests against a scripted runtime

mod common;

use common::{cpu_config, model_file, ScriptedRuntime};
use engine_core::{
    EngineError, EngineHost, GenerationRequest, InferenceSession, Phase, SessionHandle, Token,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn generate_all(
    host: &mut EngineHost<ScriptedRuntime>,
    handle: SessionHandle,
    request: &GenerationRequest,
) -> Vec<String> {
    let mut out = Vec::new();
    for _ in 0..request.max_tokens {
        match host.generate_next(handle, request).unwrap() {
            Token::Fragment(text) => out.push(text),
            Token::EndOfSequence => break,
        }
    }
    out
}

#[test]
fn test_reference_cpu_scenario() {
    let model = model_file();
    let mut host = EngineHost::new(ScriptedRuntime::default());

    let handle = host.open(cpu_config(&model)).unwrap();
    assert_eq!(host.phase(), Phase::Ready);

    let prompt = "Hello world";
    let count = host.ingest_prompt(handle, prompt).unwrap();
    assert!(count > 0 && count <= prompt.len());

    let request = GenerationRequest::new(64).with_seed(7);
    for _ in 0..3 {
        let token = host.generate_next(handle, &request).unwrap();
        assert!(!token.is_end_of_sequence());
    }

    host.request_stop(handle);
    assert_eq!(host.generate_next(handle, &request).unwrap(), Token::EndOfSequence);
    assert_eq!(host.phase(), Phase::Stopped);

    host.reset_context(handle).unwrap();
    assert_eq!(host.phase(), Phase::Ready);
    host.ingest_prompt(handle, prompt).unwrap();
    assert!(!generate_all(&mut host, handle, &GenerationRequest::new(4)).is_empty());

    host.release(handle);
    assert_eq!(host.phase(), Phase::Released);
    assert_eq!(host.runtime().live_handles(), 0);
}

#[test]
fn test_ingest_without_open() {
    let mut host = EngineHost::new(ScriptedRuntime::default());
    let never_issued = SessionHandle::from_raw(1).unwrap();

    let err = host.ingest_prompt(never_issued, "Hello").unwrap_err();
    assert!(matches!(err, EngineError::NotInitialized));
    assert_eq!(host.runtime().prefills.load(Ordering::SeqCst), 0);
}

#[test]
fn test_second_open_with_other_model_supersedes() {
    let first_model = model_file();
    let second_model = model_file();
    let mut host = EngineHost::new(ScriptedRuntime::default());

    let first = host.open(cpu_config(&first_model)).unwrap();
    let second = host.open(cpu_config(&second_model)).unwrap();

    assert_eq!(host.runtime().live_handles(), 1);
    assert_eq!(
        host.session(second).unwrap().config().model_path,
        second_model.path()
    );

    assert!(host.ingest_prompt(first, "stale").unwrap_err().is_not_initialized());
    assert!(host.reset_context(first).unwrap_err().is_not_initialized());
    assert_eq!(
        host.generate_next(first, &GenerationRequest::new(1)).unwrap(),
        Token::EndOfSequence
    );
    host.request_stop(first);
    host.release(first);

    assert_eq!(host.phase(), Phase::Ready);
    assert!(host.ingest_prompt(second, "still alive").is_ok());
}

#[test]
fn test_release_is_safe_on_every_path() {
    let model = model_file();
    let runtime = Arc::new(ScriptedRuntime::default());
    let mut host = EngineHost::with_shared(Arc::clone(&runtime));

    // Normal completion, released twice
    let handle = host.open(cpu_config(&model)).unwrap();
    host.ingest_prompt(handle, "a b").unwrap();
    host.release(handle);
    host.release(handle);
    assert_eq!(runtime.live_handles(), 0);

    // Cancellation
    let handle = host.open(cpu_config(&model)).unwrap();
    host.request_stop(handle);
    host.release(handle);
    assert_eq!(runtime.live_handles(), 0);

    // A failed open allocates nothing
    assert!(host.open(cpu_config(&model).with_threads(0)).is_err());
    assert_eq!(runtime.loads.load(Ordering::SeqCst), 2);

    // Dropping the host releases the live session
    let handle = host.open(cpu_config(&model)).unwrap();
    host.ingest_prompt(handle, "c").unwrap();
    assert_eq!(runtime.live_handles(), 1);
    drop(host);

    assert_eq!(runtime.live_handles(), 0);
    assert_eq!(runtime.frees.load(Ordering::SeqCst), 3);
}

#[test]
fn test_same_seed_same_tokens() {
    let model = model_file();
    let request = GenerationRequest::new(24)
        .with_temperature(0.9)
        .with_top_p(0.9)
        .with_top_k(8)
        .with_seed(1234);

    let run = || {
        let mut host = EngineHost::new(ScriptedRuntime::default());
        let handle = host.open(cpu_config(&model)).unwrap();
        host.ingest_prompt(handle, "Hello world from the test").unwrap();
        generate_all(&mut host, handle, &request)
    };

    let first = run();
    let second = run();
    assert_eq!(first.len(), 24);
    assert_eq!(first, second);
}

#[test]
fn test_reset_replays_the_same_sequence() {
    let model = model_file();
    let mut host = EngineHost::new(ScriptedRuntime::default());
    let handle = host.open(cpu_config(&model)).unwrap();
    let request = GenerationRequest::new(10).with_seed(99);

    host.ingest_prompt(handle, "Hello world").unwrap();
    let before = generate_all(&mut host, handle, &request);

    host.reset_context(handle).unwrap();
    host.ingest_prompt(handle, "Hello world").unwrap();
    let after = generate_all(&mut host, handle, &request);

    assert_eq!(before, after);
}

#[test]
fn test_cancellation_does_not_advance_counters() {
    let model = model_file();
    let runtime = Arc::new(ScriptedRuntime::default());
    let mut session = InferenceSession::open(Arc::clone(&runtime), cpu_config(&model)).unwrap();
    session.ingest_prompt("Hello world").unwrap();

    let request = GenerationRequest::new(8);
    session.generate_next(&request).unwrap();
    let used = session.context_used();
    let generated = session.tokens_generated();
    let samples = runtime.samples.load(Ordering::SeqCst);

    session.request_stop();
    for _ in 0..5 {
        assert_eq!(session.generate_next(&request).unwrap(), Token::EndOfSequence);
    }

    assert_eq!(session.context_used(), used);
    assert_eq!(session.tokens_generated(), generated);
    assert_eq!(runtime.samples.load(Ordering::SeqCst), samples);
}

#[test]
fn test_stop_from_another_thread_ends_the_loop() {
    let model = model_file();
    let runtime = Arc::new(ScriptedRuntime::default());
    let mut session = InferenceSession::open(Arc::clone(&runtime), cpu_config(&model)).unwrap();
    session.ingest_prompt("Hello").unwrap();

    let signal = session.stop_signal();
    let watcher = {
        let runtime = Arc::clone(&runtime);
        thread::spawn(move || {
            while runtime.samples.load(Ordering::SeqCst) < 5 {
                thread::sleep(Duration::from_millis(1));
            }
            signal.request_stop();
            runtime.samples.load(Ordering::SeqCst)
        })
    };

    let request = GenerationRequest::new(4000);
    let mut steps = 0;
    loop {
        steps += 1;
        assert!(steps < 4000, "stop was never observed");
        if session.generate_next(&request).unwrap().is_end_of_sequence() {
            break;
        }
        if watcher.is_finished() {
            // Give the loop at most one more step to observe the flag
            assert!(session
                .generate_next(&request)
                .unwrap()
                .is_end_of_sequence());
            break;
        }
    }

    let samples_at_stop = watcher.join().unwrap();
    assert!(session.is_stop_requested());
    assert!(runtime.samples.load(Ordering::SeqCst) <= samples_at_stop + 1);
}

#[test]
fn test_model_end_of_sequence_keeps_session_ready() {
    let model = model_file();
    let runtime = ScriptedRuntime {
        eos_after: Some(3),
        ..Default::default()
    };
    let mut host = EngineHost::new(runtime);
    let handle = host.open(cpu_config(&model)).unwrap();
    host.ingest_prompt(handle, "Hello").unwrap();

    let text = generate_all(&mut host, handle, &GenerationRequest::new(50).with_temperature(0.0));
    assert_eq!(text.len(), 3);
    assert_eq!(host.phase(), Phase::Ready);
    assert!(!host.session(handle).unwrap().is_stop_requested());
}

#[test]
fn test_stream_collects_text() {
    let model = model_file();
    let runtime = Arc::new(ScriptedRuntime {
        eos_after: Some(5),
        ..Default::default()
    });
    let mut session = InferenceSession::open(runtime, cpu_config(&model)).unwrap();
    session.ingest_prompt("Hello world").unwrap();

    let pieces = session
        .stream(GenerationRequest::new(32).with_temperature(0.0))
        .collect::<engine_core::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(pieces.len(), 5);
    assert_eq!(session.tokens_generated(), 5);
    // The closing end-of-sequence takes no position
    assert_eq!(session.context_used(), 2 + 5);
}

#[test]
fn test_unsupported_backend_fails_open_and_host_recovers() {
    let model = model_file();
    let mut host = EngineHost::new(ScriptedRuntime::default());

    let err = host
        .open(cpu_config(&model).with_backend(engine_core::HardwareBackend::VulkanGpu))
        .unwrap_err();
    assert!(matches!(err, EngineError::Initialization { .. }));
    assert_eq!(host.phase(), Phase::Uninitialized);

    assert!(host.open(cpu_config(&model)).is_ok());
}
