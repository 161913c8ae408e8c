use std::env;

use rusty_fork::rusty_fork_test;
use tracing_subscriber::fmt::format::FmtSpan;

use s3mirror::config::TracingConfig;

const EVENT_FILTER_ENV_VAR: &str = "RUST_LOG";
const AWS_SDK_TARGETS: [&str; 3] = ["aws_smithy_runtime", "aws_config", "aws_sigv4"];

pub fn init_tracing(config: &TracingConfig) {
    let fmt_span = if config.span_events_tracing {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let (event_filter, show_target) =
        event_filter(config, env::var(EVENT_FILTER_ENV_VAR).ok());

    let subscriber_builder = tracing_subscriber::fmt()
        .compact()
        .with_ansi(!config.disable_color_tracing)
        .with_span_events(fmt_span)
        .with_env_filter(event_filter)
        .with_target(show_target);

    if config.json_tracing {
        subscriber_builder.json().init();
    } else {
        subscriber_builder.init();
    }
}

/// Filter directives and whether event targets are shown.
/// AWS SDK tracing wins over `RUST_LOG`, which wins over the configured level.
fn event_filter(config: &TracingConfig, env_filter: Option<String>) -> (String, bool) {
    let tracing_level = config.tracing_level;

    if config.aws_sdk_tracing {
        let directives = std::iter::once("s3mirror")
            .chain(AWS_SDK_TARGETS)
            .map(|target| format!("{target}={tracing_level}"))
            .collect::<Vec<_>>()
            .join(",");
        return (directives, true);
    }

    if let Some(env_filter) = env_filter {
        return (env_filter, true);
    }

    (format!("s3mirror={tracing_level}"), false)
}


rusty_fork_test! {
    #[test]
    fn init_json_tracing() {
        init_tracing(&TracingConfig {
            tracing_level: log::Level::Info,
            json_tracing: true,
            aws_sdk_tracing: false,
            span_events_tracing: false,
            disable_color_tracing: false});
    }

    #[test]
    fn init_span_events_tracing() {
        init_tracing(&TracingConfig {
            tracing_level: log::Level::Info,
            json_tracing: false,
            aws_sdk_tracing: true,
            span_events_tracing: true,
            disable_color_tracing: true,
        });
    }

    #[test]
    fn init_with_env() {
        // runs in a separate process
        unsafe { env::set_var(EVENT_FILTER_ENV_VAR, "trace") };

        init_tracing(&TracingConfig {
            tracing_level: log::Level::Info,
            json_tracing: false,
            aws_sdk_tracing: false,
            span_events_tracing: false,
            disable_color_tracing: false,
        });
    }
}
