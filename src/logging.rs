// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Logging Setup
//!
//! Installs the global tracing subscriber: human-readable output locally, bunyan
//! JSON everywhere else.

use crate::{
    configs::{AppConfigs, Environment},
    errors::AmqpError,
};
use tracing::warn;
use tracing_bunyan_formatter::BunyanFormattingLayer;
use tracing_log::LogTracer;
use tracing_subscriber::{
    filter::{LevelFilter, Targets},
    fmt::{
        format::{Format, Pretty},
        Layer,
    },
    layer::SubscriberExt,
};

pub fn setup(cfg: &AppConfigs) -> Result<(), AmqpError> {
    if let Err(err) = LogTracer::init() {
        warn!(
            error = err.to_string(),
            "failure to initialize logger, probably the log was already initialized"
        );
    }

    let level_filter = get_log_level_filter(cfg);

    let mut target_filters = Targets::new().with_default(level_filter);
    if !cfg.enable_external_crates_logging {
        target_filters = target_filters
            .with_target("lapin", LevelFilter::WARN)
            .with_target("amq_protocol", LevelFilter::WARN)
            .with_target("pinky_swear", LevelFilter::WARN)
            .with_target("async_io", LevelFilter::WARN)
            .with_target("polling", LevelFilter::WARN)
            .with_target("log", LevelFilter::WARN);
    }

    let mut fmt_pretty: Option<Layer<_, Pretty, Format<Pretty>>> = None;
    let mut fmt_json = None;

    if cfg.env == Environment::Local {
        fmt_pretty = Some(Layer::new().pretty());
    } else {
        fmt_json = Some(BunyanFormattingLayer::new(
            cfg.name.to_owned(),
            std::io::stdout,
        ));
    }

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(fmt_json)
            .with(fmt_pretty)
            .with(target_filters),
    )
    .map_err(|err| {
        warn!(error = err.to_string(), "failure to set tracing subscribe");
        AmqpError::InternalError
    })
}

fn get_log_level_filter(cfg: &AppConfigs) -> LevelFilter {
    match cfg.log_level.to_lowercase().as_str() {
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "trace" => LevelFilter::TRACE,
        _ => LevelFilter::OFF,
    }
}
