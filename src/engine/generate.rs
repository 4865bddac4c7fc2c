//! Batch generation: prompts → final text via an engine's event stream.
//!
//! [`ServeEngine`] wraps any [`GenerationEngine`]. A batch call takes over the
//! engine's stream callback, submits one request per prompt, and steps the
//! engine until every request is finished. Each stream event is routed by id
//! through that request's detokenizer and stop-string matcher.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::ServeError;
use crate::tokenizer::Tokenizer;

use super::callback::{CallbackGuard, GenerationEngine, RequestStreamCallback};
use super::config::GenerationConfigs;
use super::registry::RequestRegistry;
use super::request::{GenerationOutput, Prompt, Request, RequestStreamOutput};
use super::stats::EngineStats;
use super::trace::EventTraceRecorder;

/// State shared between a batch call and its installed callback.
struct BatchState {
    registry: RequestRegistry,
    /// First fault raised while handling events. Later events are ignored.
    fault: Option<ServeError>,
}

/// Batch text generation over a step-driven engine.
///
/// Only one batch call runs against the wrapped engine at a time; `&mut self`
/// enforces that within a thread.
pub struct ServeEngine<E: GenerationEngine> {
    engine: E,
    tokenizer: Arc<dyn Tokenizer>,
    trace: Option<Rc<EventTraceRecorder>>,
}

impl<E: GenerationEngine> ServeEngine<E> {
    /// `tokenizer` must match the one the engine generates with.
    pub fn new(engine: E, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            engine,
            tokenizer,
            trace: None,
        }
    }

    /// Record request lifecycle events for later [`trace_recorder`](Self::trace_recorder) dumps.
    pub fn enable_tracing(&mut self) {
        if self.trace.is_none() {
            self.trace = Some(Rc::new(EventTraceRecorder::new()));
        }
    }

    pub fn trace_recorder(&self) -> Option<&EventTraceRecorder> {
        self.trace.as_deref()
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    /// Generate one string per prompt, in prompt order.
    ///
    /// `configs` is either one [`GenerationConfig`](super::config::GenerationConfig)
    /// shared by every prompt or a `Vec` with exactly one per prompt.
    pub fn generate<I>(
        &mut self,
        prompts: I,
        configs: impl Into<GenerationConfigs>,
    ) -> Result<Vec<String>, ServeError>
    where
        I: IntoIterator,
        I::Item: Into<Prompt>,
    {
        Ok(self
            .generate_full(prompts, configs)?
            .into_iter()
            .map(|output| output.text)
            .collect())
    }

    /// Like [`generate`](Self::generate), also reporting each finish reason.
    pub fn generate_full<I>(
        &mut self,
        prompts: I,
        configs: impl Into<GenerationConfigs>,
    ) -> Result<Vec<GenerationOutput>, ServeError>
    where
        I: IntoIterator,
        I::Item: Into<Prompt>,
    {
        let prompts: Vec<Prompt> = prompts.into_iter().map(Into::into).collect();
        if prompts.is_empty() {
            return Ok(Vec::new());
        }
        let configs = configs.into().resolve(prompts.len())?;

        let registry = {
            let stop_strs: Vec<&[String]> =
                configs.iter().map(|config| config.stop_strs.as_slice()).collect();
            RequestRegistry::new(&self.tokenizer, &stop_strs)
        };
        let num_requests = registry.len();
        let batch = Rc::new(RefCell::new(BatchState {
            registry,
            fault: None,
        }));

        info!(num_requests, "Starting batch generation");
        let callback = batch_callback(Rc::clone(&batch), self.trace.clone());
        let mut num_steps = 0usize;
        {
            let mut engine = CallbackGuard::install(&mut self.engine, callback);

            for (index, (prompt, config)) in prompts.into_iter().zip(configs).enumerate() {
                let request_id = index.to_string();
                engine.add_request(Request::new(request_id.as_str(), prompt, config))?;
                batch.borrow_mut().registry.mark_submitted(index)?;
                if let Some(trace) = &self.trace {
                    trace.add_event(&request_id, "start request");
                }
                debug!(request_id = index, "Request submitted");
            }

            loop {
                {
                    let mut state = batch.borrow_mut();
                    if let Some(fault) = state.fault.take() {
                        return Err(fault);
                    }
                    if state.registry.all_finished() {
                        break;
                    }
                }
                engine.step()?;
                num_steps += 1;
            }
        }

        let registry = std::mem::take(&mut batch.borrow_mut().registry);
        let outputs = registry.into_outputs().ok_or_else(|| {
            ServeError::Engine("batch ended with unfinished requests".to_string())
        })?;
        info!(num_requests, num_steps, "Batch generation complete");
        Ok(outputs)
    }

    pub fn add_request(&mut self, request: Request) -> Result<(), ServeError> {
        self.engine.add_request(request)
    }

    pub fn abort_request(&mut self, request_id: &str) -> Result<(), ServeError> {
        self.engine.abort_request(request_id)
    }

    pub fn step(&mut self) -> Result<(), ServeError> {
        self.engine.step()
    }

    pub fn reset(&mut self) -> Result<(), ServeError> {
        self.engine.reset()
    }

    pub fn stats(&self) -> Result<EngineStats, ServeError> {
        EngineStats::from_json(&self.engine.stats()?)
    }
}

/// The batch-scoped callback: routes every event into the registry.
///
/// A fault cannot propagate through the engine, so it is parked in the batch
/// state for the driving loop to return once `step` comes back.
fn batch_callback(
    batch: Rc<RefCell<BatchState>>,
    trace: Option<Rc<EventTraceRecorder>>,
) -> RequestStreamCallback {
    Rc::new(move |outputs: &[RequestStreamOutput]| {
        let mut state = batch.borrow_mut();
        if state.fault.is_some() {
            return;
        }
        for output in outputs {
            match state.registry.deliver(output) {
                Ok((_, Some(reason))) => {
                    if let Some(trace) = &trace {
                        trace.add_event(&output.request_id, &format!("finished: {reason}"));
                        trace.add_event(&output.request_id, "finish request");
                    }
                }
                Ok((_, None)) => {}
                Err(err) => {
                    warn!(request_id = %output.request_id, error = %err, "Stream protocol fault");
                    state.fault = Some(err);
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::{EngineConfig, GenerationConfig};
    use crate::engine::replay::{ReplayEngine, ReplayScript, ReplayStep};
    use crate::engine::request::FinishReason;
    use crate::tokenizer::VocabTokenizer;

    fn event(id: &str, ids: &[u32], reason: Option<FinishReason>) -> RequestStreamOutput {
        RequestStreamOutput::new(id, ids.to_vec(), reason)
    }

    fn serve(steps: Vec<ReplayStep>) -> ServeEngine<ReplayEngine> {
        let engine = ReplayEngine::new(EngineConfig::default(), ReplayScript::new(steps));
        ServeEngine::new(engine, Arc::new(VocabTokenizer::for_testing()))
    }

    fn eos() -> Option<FinishReason> {
        Some(FinishReason::Other("eos".to_string()))
    }

    #[test]
    fn test_stop_string_example() {
        // "Hello" + "!!!" and "World" + "."
        let mut serve = serve(vec![
            ReplayStep::single(vec![event("0", &[15], None), event("1", &[16], None)]),
            ReplayStep::new(vec![
                vec![event("1", &[14], eos())],
                vec![event("0", &[13, 13, 13], Some(FinishReason::Length))],
            ]),
        ]);
        let config = GenerationConfig::default().with_stop_strs(["!"]);
        let outputs = serve.generate_full(["Hello", "World"], config).unwrap();
        assert_eq!(outputs[0].text, "Hello");
        assert_eq!(outputs[0].finish_reason, FinishReason::Stop);
        assert_eq!(outputs[1].text, "World.");
        assert_eq!(outputs[1].finish_reason, FinishReason::Other("eos".to_string()));
    }

    #[test]
    fn test_shared_config_broadcast() {
        let mut serve = serve(vec![ReplayStep::single(vec![
            event("0", &[15], eos()),
            event("1", &[16], eos()),
            event("2", &[13], eos()),
        ])]);
        let config = GenerationConfig::default()
            .with_stop_strs(["\n"])
            .with_max_tokens(9);
        let texts = serve.generate(["a", "b", "c"], &config).unwrap();
        assert_eq!(texts, vec!["Hello", "World", "!"]);

        let submitted = serve.engine().submitted();
        assert_eq!(submitted.len(), 3);
        assert!(submitted.iter().all(|r| r.generation_config == config));
        let ids: Vec<&str> = submitted.iter().map(|r| r.request_id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
    }

    #[test]
    fn test_config_count_mismatch_before_submit() {
        let mut serve = serve(Vec::new());
        let configs = vec![GenerationConfig::default(); 2];
        let result = serve.generate(["a", "b", "c"], configs);
        assert!(matches!(
            result,
            Err(ServeError::ConfigCountMismatch { configs: 2, prompts: 3 })
        ));
        assert!(serve.engine().submitted().is_empty());
        assert!(serve.engine().request_stream_callback().is_none());
    }

    #[test]
    fn test_per_prompt_configs() {
        let mut serve = serve(vec![ReplayStep::single(vec![
            event("0", &[15, 13], eos()),
            event("1", &[15, 13], eos()),
        ])]);
        let configs = vec![
            GenerationConfig::default().with_stop_strs(["!"]),
            GenerationConfig::default(),
        ];
        let outputs = serve.generate_full(["a", "b"], configs).unwrap();
        assert_eq!(outputs[0].text, "Hello");
        assert_eq!(outputs[0].finish_reason, FinishReason::Stop);
        assert_eq!(outputs[1].text, "Hello!");
        assert_eq!(outputs[1].finish_reason, FinishReason::Other("eos".to_string()));
    }

    #[test]
    fn test_empty_batch_skips_engine() {
        let mut serve = serve(Vec::new());
        let outputs = serve
            .generate(Vec::<Prompt>::new(), GenerationConfig::default())
            .unwrap();
        assert!(outputs.is_empty());
        assert_eq!(serve.engine().num_steps(), 0);
    }

    #[test]
    fn test_results_in_prompt_order() {
        let mut serve = serve(vec![
            ReplayStep::single(vec![event("2", &[13], eos())]),
            ReplayStep::default(),
            ReplayStep::single(vec![event("1", &[16], eos())]),
            ReplayStep::single(vec![event("0", &[15], eos())]),
        ]);
        let texts = serve
            .generate(["a", "b", "c"], GenerationConfig::default())
            .unwrap();
        assert_eq!(texts, vec!["Hello", "World", "!"]);
        assert_eq!(serve.engine().num_steps(), 4);
    }

    #[test]
    fn test_engine_reason_passes_through() {
        let mut serve = serve(vec![
            ReplayStep::single(vec![event("0", &[15], None)]),
            ReplayStep::single(vec![event("0", &[16, 14], None)]),
        ]);
        let config = GenerationConfig::default().with_max_tokens(2);
        let outputs = serve.generate_full(["a"], config).unwrap();
        assert_eq!(outputs[0].text, "Hello World");
        assert_eq!(outputs[0].finish_reason, FinishReason::Length);
    }

    #[test]
    fn test_stop_across_events() {
        let mut serve = serve(vec![
            ReplayStep::single(vec![event("0", &[15, 14], None)]),
            ReplayStep::single(vec![event("0", &[16], eos())]),
        ]);
        let config = GenerationConfig::default().with_stop_strs([". "]);
        let outputs = serve.generate_full(["a"], config).unwrap();
        assert_eq!(outputs[0].text, "Hello");
        assert_eq!(outputs[0].finish_reason, FinishReason::Stop);
    }

    #[test]
    fn test_callback_restored_after_batch() {
        let mut serve = serve(vec![ReplayStep::single(vec![event("0", &[15], eos())])]);
        let original: RequestStreamCallback = Rc::new(|_: &[RequestStreamOutput]| {});
        serve
            .engine_mut()
            .set_request_stream_callback(Some(original.clone()));
        serve.generate(["a"], GenerationConfig::default()).unwrap();
        let installed = serve.engine().request_stream_callback().unwrap();
        assert!(Rc::ptr_eq(&installed, &original));
    }

    #[test]
    fn test_unknown_request_id_is_fault() {
        let mut serve = serve(vec![ReplayStep::single(vec![
            event("0", &[15], None),
            event("7", &[16], None),
            event("0", &[], eos()),
        ])]);
        let original: RequestStreamCallback = Rc::new(|_: &[RequestStreamOutput]| {});
        serve
            .engine_mut()
            .set_request_stream_callback(Some(original.clone()));
        let err = serve
            .generate(["a"], GenerationConfig::default())
            .unwrap_err();
        assert!(matches!(err, ServeError::UnknownRequest { num_requests: 1, .. }));
        assert!(err.is_protocol_fault());
        let installed = serve.engine().request_stream_callback().unwrap();
        assert!(Rc::ptr_eq(&installed, &original));
    }

    #[test]
    fn test_event_after_stop_is_fault() {
        // The engine keeps streaming a request already finished by a stop string.
        let mut serve = serve(vec![
            ReplayStep::single(vec![event("0", &[15, 13], None), event("1", &[16], None)]),
            ReplayStep::single(vec![event("0", &[16], eos())]),
        ]);
        let config = GenerationConfig::default().with_stop_strs(["!"]);
        let err = serve.generate(["a", "b"], config).unwrap_err();
        assert!(matches!(err, ServeError::RequestFinished(0)));
    }

    #[test]
    fn test_engine_ends_request_on_stop_string() {
        // Request 0 would keep streaming "!" while request 1 is still live.
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(VocabTokenizer::for_testing());
        let script = ReplayScript::new(vec![
            ReplayStep::single(vec![event("0", &[15], None), event("1", &[16], None)]),
            ReplayStep::single(vec![event("0", &[13], None)]),
            ReplayStep::single(vec![event("0", &[13], None), event("1", &[14], eos())]),
            ReplayStep::single(vec![event("0", &[13], eos())]),
        ]);
        let engine = ReplayEngine::new(EngineConfig::default(), script)
            .with_tokenizer(Arc::clone(&tokenizer));
        let mut serve = ServeEngine::new(engine, tokenizer);
        let configs = vec![
            GenerationConfig::default().with_stop_strs(["!"]),
            GenerationConfig::default(),
        ];
        let outputs = serve.generate_full(["a", "b"], configs).unwrap();
        assert_eq!(outputs[0].text, "Hello");
        assert_eq!(outputs[0].finish_reason, FinishReason::Stop);
        assert_eq!(outputs[1].text, "World.");
        assert_eq!(serve.engine().num_steps(), 3);
    }

    #[test]
    fn test_engine_ends_request_on_stop_token() {
        let mut serve = serve(vec![
            ReplayStep::single(vec![event("0", &[15, 13, 16], None)]),
            ReplayStep::single(vec![event("0", &[14], Some(FinishReason::Length))]),
        ]);
        let config = GenerationConfig {
            stop_token_ids: vec![13],
            ..Default::default()
        };
        let outputs = serve.generate_full(["a"], config).unwrap();
        assert_eq!(outputs[0].text, "Hello!");
        assert_eq!(outputs[0].finish_reason, FinishReason::Stop);
    }

    #[test]
    fn test_engine_fault_yields_no_results() {
        let mut serve = serve(vec![ReplayStep::single(vec![event("0", &[15], eos())])]);
        let result = serve.generate(["a", "b"], GenerationConfig::default());
        assert!(matches!(result, Err(ServeError::Engine(_))));
        assert!(serve.engine().request_stream_callback().is_none());
    }

    #[test]
    fn test_rejected_request_restores_callback() {
        let config = EngineConfig {
            max_single_sequence_length: 2,
            ..Default::default()
        };
        let engine = ReplayEngine::new(config, ReplayScript::default());
        let mut serve = ServeEngine::new(engine, Arc::new(VocabTokenizer::for_testing()));
        let result = serve.generate([vec![1u32, 15, 16]], GenerationConfig::default());
        assert!(matches!(result, Err(ServeError::Engine(_))));
        assert!(serve.engine().request_stream_callback().is_none());
    }

    #[test]
    fn test_token_id_prompts() {
        let mut serve = serve(vec![ReplayStep::single(vec![
            event("0", &[13], eos()),
            event("1", &[14], eos()),
        ])]);
        let prompts = vec![Prompt::Tokens(vec![1, 15]), Prompt::Text("World".to_string())];
        let texts = serve.generate(prompts, GenerationConfig::default()).unwrap();
        assert_eq!(texts, vec!["!", "."]);
        assert_eq!(
            serve.engine().submitted()[0].inputs,
            Prompt::Tokens(vec![1, 15])
        );
    }

    #[test]
    fn test_sequential_batches_reuse_ids() {
        let mut serve = serve(vec![
            ReplayStep::single(vec![event("0", &[15], eos())]),
            ReplayStep::single(vec![event("0", &[16], eos())]),
        ]);
        let first = serve.generate(["a"], GenerationConfig::default()).unwrap();
        let second = serve.generate(["b"], GenerationConfig::default()).unwrap();
        assert_eq!(first, vec!["Hello"]);
        assert_eq!(second, vec!["World"]);
    }

    #[test]
    fn test_tracing_records_request_spans() {
        let mut serve = serve(vec![ReplayStep::single(vec![event("0", &[15], eos())])]);
        serve.enable_tracing();
        serve.generate(["a"], GenerationConfig::default()).unwrap();
        let dump: serde_json::Value =
            serde_json::from_str(&serve.trace_recorder().unwrap().dump_json().unwrap()).unwrap();
        let phases: Vec<&str> = dump["traceEvents"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["ph"].as_str().unwrap())
            .collect();
        assert_eq!(phases, vec!["B", "i", "E"]);
    }

    #[test]
    fn test_stats_pass_through() {
        let mut serve = serve(vec![ReplayStep::single(vec![event("0", &[15, 16], eos())])]);
        serve
            .generate([vec![1u32, 2, 3]], GenerationConfig::default())
            .unwrap();
        let stats = serve.stats().unwrap();
        assert_eq!(stats.total_prefill_tokens, 3);
        assert_eq!(stats.total_decode_tokens, 2);
    }

    #[test]
    fn test_abort_pass_through() {
        let mut serve = serve(vec![ReplayStep::default()]);
        serve
            .add_request(Request::new("x", "a", GenerationConfig::default()))
            .unwrap();
        serve.abort_request("x").unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        serve
            .engine_mut()
            .set_request_stream_callback(Some(Rc::new(move |outputs: &[RequestStreamOutput]| {
                sink.borrow_mut().extend(outputs.iter().cloned())
            })));
        serve.step().unwrap();
        assert_eq!(*seen.borrow(), vec![event("x", &[], Some(FinishReason::Abort))]);
        serve.reset().unwrap();
        assert_eq!(serve.engine().num_active(), 0);
    }
}
