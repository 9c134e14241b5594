// src/script.rs
//
// Sandboxed decoder script host. The project declares a script exposing
// `parse(payload)`; the host compiles it once at connect and calls it per
// frame to turn a payload into an ordered list of channel strings.

use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, Scope, AST};

use crate::error::StreamError;
use crate::tlog;

/// Soft per-invocation deadline. Exceeding it logs a slow-script warning but
/// does not cancel the call.
const SOFT_DEADLINE: Duration = Duration::from_millis(20);

/// Hard operation cap so a runaway script cannot stall the ingest thread.
const MAX_OPERATIONS: u64 = 1_000_000;

/// Compiled decoder script bound to a sandboxed engine.
///
/// The engine has no filesystem, network, or process bindings registered;
/// scripts only see the payload string they are handed.
#[derive(Debug)]
pub struct DecoderHost {
    engine: Engine,
    ast: AST,
}

impl DecoderHost {
    /// Compile the script and verify it defines `parse` with one parameter.
    /// Compilation problems are config errors surfaced at connect time.
    pub fn compile(source: &str) -> Result<Self, StreamError> {
        let mut engine = Engine::new();
        engine.on_progress(|count| {
            if count > MAX_OPERATIONS {
                Some("operation limit exceeded".into())
            } else {
                None
            }
        });

        let ast = engine
            .compile(source)
            .map_err(|e| StreamError::Config(format!("decoder script compile error: {}", e)))?;

        let has_parse = ast
            .iter_functions()
            .any(|f| f.name == "parse" && f.params.len() == 1);
        if !has_parse {
            return Err(StreamError::Config(
                "decoder script does not define parse(payload)".into(),
            ));
        }

        Ok(Self { engine, ast })
    }

    /// Run `parse(payload)` and collect the returned array as strings.
    /// Runtime failures are per-frame decode errors; the session continues.
    pub fn parse(&self, payload: &str) -> Result<Vec<String>, StreamError> {
        let started = Instant::now();
        let mut scope = Scope::new();
        let result: Dynamic = self
            .engine
            .call_fn(&mut scope, &self.ast, "parse", (payload.to_string(),))
            .map_err(|e| StreamError::Decode(format!("decoder script: {}", e)))?;

        let elapsed = started.elapsed();
        if elapsed > SOFT_DEADLINE {
            tlog!(
                "[decoder] Slow script: parse() took {} ms (soft deadline {} ms)",
                elapsed.as_millis(),
                SOFT_DEADLINE.as_millis()
            );
        }

        let array = result.try_cast::<rhai::Array>().ok_or_else(|| {
            StreamError::Decode("decoder script: parse() must return an array".into())
        })?;
        Ok(array.into_iter().map(|v| v.to_string()).collect())
    }
}
