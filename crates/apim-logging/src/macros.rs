//! ---
//! apim_section: "03-logging"
//! apim_subsection: "module"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "Structured lifecycle logging adapters."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
/// Emit an informational log enriched with scenario context.
#[macro_export]
macro_rules! scenario_info {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::INFO,
            scenario = ctx.scenario.unwrap_or(""),
            identity = ctx.identity.unwrap_or(""),
            phase = ctx.phase.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {{
        let ctx = &$crate::LogContext::default();
        tracing::event!(
            tracing::Level::INFO,
            scenario = ctx.scenario.unwrap_or(""),
            identity = ctx.identity.unwrap_or(""),
            phase = ctx.phase.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit a warning enriched with scenario context.
#[macro_export]
macro_rules! scenario_warn {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::WARN,
            scenario = ctx.scenario.unwrap_or(""),
            identity = ctx.identity.unwrap_or(""),
            phase = ctx.phase.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {{
        let ctx = &$crate::LogContext::default();
        tracing::event!(
            tracing::Level::WARN,
            scenario = ctx.scenario.unwrap_or(""),
            identity = ctx.identity.unwrap_or(""),
            phase = ctx.phase.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an error enriched with scenario context.
#[macro_export]
macro_rules! scenario_error {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::ERROR,
            scenario = ctx.scenario.unwrap_or(""),
            identity = ctx.identity.unwrap_or(""),
            phase = ctx.phase.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {{
        let ctx = &$crate::LogContext::default();
        tracing::event!(
            tracing::Level::ERROR,
            scenario = ctx.scenario.unwrap_or(""),
            identity = ctx.identity.unwrap_or(""),
            phase = ctx.phase.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}
