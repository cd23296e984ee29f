//! Ambient method/execution context, scoped per task via `tokio::task_local!`.
//!
//! Every strategy callback runs inside a method context (which strategy,
//! exchange, and frame it belongs to) and, while processing a symbol, an
//! execution context (which symbol, at what timestamp, live or backtest).
//! Both are read by user code through free functions rather than threaded as
//! explicit parameters, matching the re-architecture cue in the spec that
//! calls for task-local values over a manually threaded params object.

use std::future::Future;

use engine_types::errors::{ContextError, EngineResult};

/// Identifies which strategy/exchange/frame triple a running task belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodContext {
    pub strategy_name: String,
    pub exchange_name: String,
    pub frame_name: String,
}

/// Identifies what a running task is currently operating on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub symbol: String,
    pub when: chrono::DateTime<chrono::Utc>,
    pub backtest: bool,
}

tokio::task_local! {
    static METHOD_CONTEXT: MethodContext;
    static EXECUTION_CONTEXT: ExecutionContext;
}

/// Runs `fut` with `ctx` installed as the method context for its duration.
/// The context is torn down the moment `fut` resolves, including on panic
/// unwinding through it, since it never outlives the `task_local` scope.
pub async fn with_method_context<F, T>(ctx: MethodContext, fut: F) -> T
where
    F: Future<Output = T>,
{
    METHOD_CONTEXT.scope(ctx, fut).await
}

/// Runs `fut` with `ctx` installed as the execution context for its duration.
pub async fn with_execution_context<F, T>(ctx: ExecutionContext, fut: F) -> T
where
    F: Future<Output = T>,
{
    EXECUTION_CONTEXT.scope(ctx, fut).await
}

/// Reads the current method context, cloning it out of the task-local slot.
pub fn method_context() -> EngineResult<MethodContext> {
    METHOD_CONTEXT
        .try_with(|ctx| ctx.clone())
        .map_err(|_| ContextError::MethodContextMissing.into())
}

/// Reads the current execution context, cloning it out of the task-local slot.
pub fn execution_context() -> EngineResult<ExecutionContext> {
    EXECUTION_CONTEXT
        .try_with(|ctx| ctx.clone())
        .map_err(|_| ContextError::ExecutionContextMissing.into())
}

/// `true` if a method context is currently installed on this task.
pub fn has_method_context() -> bool {
    METHOD_CONTEXT.try_with(|_| ()).is_ok()
}

/// `true` if an execution context is currently installed on this task.
pub fn has_execution_context() -> bool {
    EXECUTION_CONTEXT.try_with(|_| ()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn method_context_visible_inside_scope_only() {
        assert!(!has_method_context());

        let ctx = MethodContext {
            strategy_name: "trend".into(),
            exchange_name: "binance".into(),
            frame_name: "1m".into(),
        };

        with_method_context(ctx.clone(), async {
            assert!(has_method_context());
            let read = method_context().unwrap();
            assert_eq!(read, ctx);
        })
        .await;

        assert!(!has_method_context());
    }

    #[tokio::test]
    async fn execution_context_missing_outside_scope_is_an_error() {
        let result = execution_context();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn nested_contexts_compose() {
        let method_ctx = MethodContext {
            strategy_name: "trend".into(),
            exchange_name: "binance".into(),
            frame_name: "1m".into(),
        };
        let exec_ctx = ExecutionContext {
            symbol: "BTCUSDT".into(),
            when: Utc::now(),
            backtest: true,
        };

        with_method_context(method_ctx, async {
            with_execution_context(exec_ctx.clone(), async {
                assert!(has_method_context());
                assert!(has_execution_context());
                assert_eq!(execution_context().unwrap(), exec_ctx);
            })
            .await;
        })
        .await;
    }
}
