// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Command Line Surface
//!
//! `consumer` runs named consumers on one runner, `purge` empties a consumer's queues
//! and `setup-fabric` declares the fabric of every registered producer and consumer.
//! Handlers are application code, so the binary embedding this module supplies them
//! through a [`HandlerRegistry`] and calls [`execute`].

use crate::{
    channel::AmqpConnection,
    client::LapinConnection,
    configs::Configs,
    errors::AmqpError,
    logging,
    registry::{HandlerRegistry, RabbitMqDefinitions, Registry},
    runner::{ConsumerRunner, StopHandle},
};
use clap::{Args, Parser, Subcommand};
use futures_util::{Stream, StreamExt};
use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const BYTES_PER_MEGABYTE: u64 = 1024 * 1024;

/// Exit status after a second interrupting signal, 128 + SIGINT.
const EXIT_CODE_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "amqp-runner", version, about, long_about = None)]
pub struct Cli {
    /// JSON file with the producer and consumer definitions
    #[arg(long, env = "AMQP_DEFINITIONS", default_value = "rabbitmq.json")]
    pub definitions: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Runs one or more consumers on a shared channel
    Consumer(ConsumerArgs),
    /// Purges the queues of a consumer
    Purge(PurgeArgs),
    /// Declares the fabric of every producer and consumer
    SetupFabric,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ConsumerArgs {
    /// Consumer names
    #[arg(required = true)]
    pub names: Vec<String>,

    /// Messages to consume before stopping, 0 for no limit
    #[arg(short = 'm', long, default_value_t = 0)]
    pub messages: u64,

    /// Seconds to wait for a message before emitting an idle timeout, 0 to wait forever.
    /// Defaults to the consumers' configured idle timeout
    #[arg(short = 't', long)]
    pub idle_timeout: Option<u64>,

    /// Routing key the consumers' queues are bound with
    #[arg(short = 'r', long)]
    pub route: Option<String>,

    /// Stop once the process uses more than this many megabytes
    #[arg(short = 'l', long)]
    pub memory_limit: Option<u64>,

    /// Do not stop on SIGTERM, SIGINT or SIGHUP
    #[arg(short = 'w', long)]
    pub without_signals: bool,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct PurgeArgs {
    /// Consumer name
    pub name: String,

    /// Purge without asking for confirmation
    #[arg(long)]
    pub no_confirmation: bool,
}

/// How a command ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Completed,
    /// The user declined the confirmation prompt.
    Declined,
}

impl From<CommandOutcome> for ExitCode {
    fn from(outcome: CommandOutcome) -> ExitCode {
        match outcome {
            CommandOutcome::Completed => ExitCode::SUCCESS,
            CommandOutcome::Declined => ExitCode::FAILURE,
        }
    }
}

/// Loads the configuration, connects and runs `cli`'s command.
pub async fn execute(cli: Cli, handlers: HandlerRegistry) -> ExitCode {
    let cfgs = Configs::from_env();

    if let Err(err) = logging::setup(&cfgs.app) {
        eprintln!("failure to setup logging: {}", err);
        return ExitCode::FAILURE;
    }

    match run(cli, &cfgs, &handlers).await {
        Ok(outcome) => outcome.into(),
        Err(err) => {
            error!(error = err.to_string(), "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    cli: Cli,
    cfgs: &Configs,
    handlers: &HandlerRegistry,
) -> Result<CommandOutcome, AmqpError> {
    let definitions = RabbitMqDefinitions::from_file(&cli.definitions)?;
    let connection = LapinConnection::connect(cfgs).await?;
    let mut registry = Registry::from_definitions(connection.clone(), &definitions, handlers)?;

    let outcome = run_command(cli.command, &mut registry, &mut stdin_confirmation).await;

    drop(registry);
    finish(outcome, connection.close().await)
}

/// Combines a command's result with the result of closing the connection; a close
/// failure never hides the command's own error.
fn finish(
    outcome: Result<CommandOutcome, AmqpError>,
    closed: Result<(), AmqpError>,
) -> Result<CommandOutcome, AmqpError> {
    match (outcome, closed) {
        (outcome, Ok(())) => outcome,
        (Ok(_), Err(err)) => Err(err),
        (Err(cmd_err), Err(err)) => {
            error!(error = err.to_string(), "failure to close the connection");
            Err(cmd_err)
        }
    }
}

/// Runs `command` against `registry`; `confirm` answers yes/no questions.
pub async fn run_command(
    command: Commands,
    registry: &mut Registry,
    confirm: &mut (dyn FnMut(&str) -> bool + Send),
) -> Result<CommandOutcome, AmqpError> {
    match command {
        Commands::Consumer(args) => consume(args, registry).await,
        Commands::Purge(args) => {
            registry.consumer(&args.name)?;

            let question = format!("Are you sure you wish to purge the queues of `{}`?", args.name);
            if !args.no_confirmation && !confirm(&question) {
                info!("purging cancelled");
                return Ok(CommandOutcome::Declined);
            }

            let purged = registry.consumer(&args.name)?.purge().await?;
            info!(consumer = %args.name, purged, "queues purged");
            Ok(CommandOutcome::Completed)
        }
        Commands::SetupFabric => {
            registry.setup_fabric().await?;
            info!("fabric declared");
            Ok(CommandOutcome::Completed)
        }
    }
}

async fn consume(args: ConsumerArgs, registry: &mut Registry) -> Result<CommandOutcome, AmqpError> {
    let mut runner = ConsumerRunner::new(registry.connection());
    let mut configured = vec![];
    for name in &args.names {
        let mut consumer = registry.take_consumer(name)?;
        if let Some(route) = &args.route {
            consumer.set_routing_key(route);
        }
        configured.push(consumer.idle_timeout());
        runner.add_consumer(consumer).await?;
    }

    if let Some(timeout) = idle_timeout(args.idle_timeout, configured) {
        runner.set_idle_timeout(timeout);
    }
    if let Some(megabytes) = args.memory_limit {
        runner.set_memory_limit(megabytes.saturating_mul(BYTES_PER_MEGABYTE));
    }

    let listener = if args.without_signals {
        None
    } else {
        Some(spawn_signal_listener(runner.stop_handle()).map_err(|err| {
            error!(error = err.to_string(), "failure to install signal handlers");
            AmqpError::InternalError
        })?)
    };

    let res = runner.consume(args.messages).await;

    if let Some(listener) = listener {
        listener.abort();
    }

    res.map(|_| CommandOutcome::Completed)
}

/// Idle timeout of a runner: the `-t` seconds when given, else the shortest idle
/// timeout configured on its consumers.
fn idle_timeout(
    seconds: Option<u64>,
    configured: impl IntoIterator<Item = Option<Duration>>,
) -> Option<Duration> {
    match seconds {
        Some(seconds) => Some(Duration::from_secs(seconds)),
        None => configured.into_iter().flatten().min(),
    }
}

/// Stops the runner behind `stop` on the first signal of `signals` and calls
/// `on_repeat` on the second one.
///
/// # Parameters
/// * `signals` - Names of the received signals
/// * `stop` - Handle of the runner to stop
/// * `on_repeat` - Called with the name of a second signal
async fn watch_signals<S, F>(mut signals: S, stop: StopHandle, on_repeat: F)
where
    S: Stream<Item = &'static str> + Unpin,
    F: FnOnce(&'static str),
{
    let Some(signal) = signals.next().await else {
        return;
    };
    info!(signal, "received signal, stopping consumers");
    stop.stop();

    if let Some(signal) = signals.next().await {
        warn!(signal, "received signal while stopping, exiting");
        on_repeat(signal);
    }
}

fn exit_interrupted(_: &'static str) {
    std::process::exit(EXIT_CODE_INTERRUPTED);
}

/// Stops the runner behind `stop` on SIGTERM, SIGINT or SIGHUP.
///
/// A second signal terminates the process without waiting for the running callback.
///
/// # Parameters
/// * `stop` - Handle of the runner to stop
///
/// # Returns
/// The listening task, or the error raised while installing the handlers
#[cfg(unix)]
pub fn spawn_signal_listener(stop: StopHandle) -> io::Result<JoinHandle<()>> {
    use futures_util::stream;
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let signals = stream::select_all([
        stream::poll_fn(move |cx| sigterm.poll_recv(cx).map(|s| s.map(|_| "SIGTERM"))).boxed(),
        stream::poll_fn(move |cx| sigint.poll_recv(cx).map(|s| s.map(|_| "SIGINT"))).boxed(),
        stream::poll_fn(move |cx| sighup.poll_recv(cx).map(|s| s.map(|_| "SIGHUP"))).boxed(),
    ]);

    Ok(tokio::spawn(watch_signals(signals, stop, exit_interrupted)))
}

/// Stops the runner behind `stop` on ctrl-c; a second ctrl-c terminates the process.
#[cfg(not(unix))]
pub fn spawn_signal_listener(stop: StopHandle) -> io::Result<JoinHandle<()>> {
    use futures_util::stream;

    let signals = stream::unfold((), |_| async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => Some(("ctrl-c", ())),
            Err(err) => {
                error!(error = err.to_string(), "failure to listen for ctrl-c");
                None
            }
        }
    })
    .boxed();

    Ok(tokio::spawn(watch_signals(signals, stop, exit_interrupted)))
}

/// Asks `question` on stdout and reads a y/n answer from stdin.
pub fn stdin_confirmation(question: &str) -> bool {
    print!("{} (y/n) ", question);
    if io::stdout().flush().is_err() {
        return false;
    }

    let mut answer = String::new();
    if io::stdin().read_line(&mut answer).is_err() {
        return false;
    }

    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consumer::{Consumer, MockMessageHandler},
        message::{Delivery, ProcessOutcome},
        mocks::{ChannelCall, FakeConnection},
        queue::QueueSpec,
    };
    use crate::exchange::ExchangeSpec;
    use futures_util::stream;
    use std::sync::Arc;

    fn consumer_args(names: &[&str]) -> ConsumerArgs {
        ConsumerArgs {
            names: names.iter().map(|n| n.to_string()).collect(),
            messages: 0,
            idle_timeout: None,
            route: None,
            memory_limit: None,
            without_signals: true,
        }
    }

    fn registry(connection: &Arc<FakeConnection>) -> Registry {
        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .returning(|_, _| Ok(ProcessOutcome::Ack));

        let mut consumer = Consumer::new(
            connection.clone(),
            QueueSpec::new("billing"),
            Arc::new(handler),
        );
        consumer.set_consumer_tag("billing-tag");
        consumer.disable_auto_setup_fabric();

        let mut registry = Registry::new(connection.clone());
        registry.add_consumer("billing", Box::new(consumer));
        registry
    }

    #[test]
    fn test_parse_consumer_command() {
        let cli = Cli::try_parse_from([
            "amqp-runner",
            "--definitions",
            "defs.json",
            "consumer",
            "billing",
            "shipping",
            "-m",
            "10",
            "-l",
            "256",
            "-r",
            "order.paid",
            "-w",
        ])
        .unwrap();

        assert_eq!(cli.definitions, PathBuf::from("defs.json"));
        assert_eq!(
            cli.command,
            Commands::Consumer(ConsumerArgs {
                names: vec!["billing".to_owned(), "shipping".to_owned()],
                messages: 10,
                idle_timeout: None,
                route: Some("order.paid".to_owned()),
                memory_limit: Some(256),
                without_signals: true,
            })
        );
    }

    #[test]
    fn test_parse_rejects_negative_messages_and_missing_names() {
        assert!(Cli::try_parse_from(["amqp-runner", "consumer", "billing", "-m", "-1"]).is_err());
        assert!(Cli::try_parse_from(["amqp-runner", "consumer"]).is_err());
    }

    #[test]
    fn test_parse_other_commands() {
        let cli = Cli::try_parse_from(["amqp-runner", "purge", "billing", "--no-confirmation"])
            .unwrap();
        assert_eq!(
            cli.command,
            Commands::Purge(PurgeArgs {
                name: "billing".to_owned(),
                no_confirmation: true,
            })
        );

        let cli = Cli::try_parse_from(["amqp-runner", "setup-fabric"]).unwrap();
        assert_eq!(cli.command, Commands::SetupFabric);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            format!("{:?}", ExitCode::from(CommandOutcome::Completed)),
            format!("{:?}", ExitCode::SUCCESS)
        );
        assert_eq!(
            format!("{:?}", ExitCode::from(CommandOutcome::Declined)),
            format!("{:?}", ExitCode::FAILURE)
        );
    }

    #[tokio::test]
    async fn test_consumer_command_runs_until_budget() {
        let connection = FakeConnection::new();
        let mut registry = registry(&connection);
        connection
            .channel()
            .push_delivery(Delivery::new(1, "billing-tag", b"x"));

        let command = Commands::Consumer(ConsumerArgs {
            messages: 1,
            idle_timeout: Some(5),
            ..consumer_args(&["billing"])
        });
        let res = run_command(command, &mut registry, &mut |_: &str| true).await;

        assert_eq!(res, Ok(CommandOutcome::Completed));
        assert_eq!(
            connection.channel().acknowledgements(),
            vec![ChannelCall::BasicAck(1)]
        );
    }

    #[tokio::test]
    async fn test_consumer_command_unknown_consumer() {
        let connection = FakeConnection::new();
        let mut registry = registry(&connection);

        let command = Commands::Consumer(consumer_args(&["invoices"]));
        let res = run_command(command, &mut registry, &mut |_: &str| true).await;

        assert_eq!(res, Err(AmqpError::UnknownConsumer("invoices".to_owned())));
    }

    #[tokio::test]
    async fn test_purge_declined() {
        let connection = FakeConnection::new();
        let mut registry = registry(&connection);

        let command = Commands::Purge(PurgeArgs {
            name: "billing".to_owned(),
            no_confirmation: false,
        });
        let res = run_command(command, &mut registry, &mut |_: &str| false).await;

        assert_eq!(res, Ok(CommandOutcome::Declined));
        assert!(connection.channel().calls().is_empty());
    }

    #[tokio::test]
    async fn test_purge_confirmed() {
        let connection = FakeConnection::new();
        let mut registry = registry(&connection);
        let mut asked = vec![];

        let command = Commands::Purge(PurgeArgs {
            name: "billing".to_owned(),
            no_confirmation: false,
        });
        let res = run_command(command, &mut registry, &mut |question: &str| {
            asked.push(question.to_owned());
            true
        })
        .await;

        assert_eq!(res, Ok(CommandOutcome::Completed));
        assert_eq!(asked.len(), 1);
        assert_eq!(
            connection.channel().calls(),
            vec![ChannelCall::QueuePurge("billing".to_owned())]
        );
    }

    #[tokio::test]
    async fn test_setup_fabric_command() {
        let connection = FakeConnection::new();
        let mut registry = registry(&connection);

        let res = run_command(Commands::SetupFabric, &mut registry, &mut |_: &str| true).await;

        assert_eq!(res, Ok(CommandOutcome::Completed));
        assert_eq!(
            connection.channel().calls(),
            vec![ChannelCall::QueueDeclare("billing".to_owned())]
        );
    }

    #[tokio::test]
    async fn test_route_overrides_consumer_routing_key() {
        let connection = FakeConnection::new();
        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .returning(|_, _| Ok(ProcessOutcome::Ack));
        let mut consumer = Consumer::new(
            connection.clone(),
            QueueSpec::new("billing"),
            Arc::new(handler),
        );
        consumer.set_consumer_tag("billing-tag");
        consumer.set_exchange(ExchangeSpec::new("orders"));
        consumer.set_routing_key("order.created");
        let mut registry = Registry::new(connection.clone());
        registry.add_consumer("billing", Box::new(consumer));
        connection
            .channel()
            .push_delivery(Delivery::new(1, "billing-tag", b"x"));

        let command = Commands::Consumer(ConsumerArgs {
            messages: 1,
            route: Some("order.paid".to_owned()),
            ..consumer_args(&["billing"])
        });
        let res = run_command(command, &mut registry, &mut |_: &str| true).await;

        assert_eq!(res, Ok(CommandOutcome::Completed));
        assert!(connection.channel().calls().contains(&ChannelCall::QueueBind(
            "billing".to_owned(),
            "orders".to_owned(),
            "order.paid".to_owned()
        )));
    }

    #[test]
    fn test_close_failure_does_not_hide_command_error() {
        assert_eq!(
            finish(Err(AmqpError::HandlerError("boom".to_owned())), Err(AmqpError::ConnectionError)),
            Err(AmqpError::HandlerError("boom".to_owned()))
        );
        assert_eq!(
            finish(Ok(CommandOutcome::Completed), Err(AmqpError::ConnectionError)),
            Err(AmqpError::ConnectionError)
        );
        assert_eq!(
            finish(Ok(CommandOutcome::Declined), Ok(())),
            Ok(CommandOutcome::Declined)
        );
    }

    #[test]
    fn test_idle_timeout_falls_back_to_consumers() {
        let configured = vec![None, Some(Duration::from_secs(30)), Some(Duration::from_secs(10))];

        assert_eq!(
            idle_timeout(None, configured.clone()),
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            idle_timeout(Some(0), configured),
            Some(Duration::ZERO)
        );
        assert_eq!(idle_timeout(None, vec![None]), None);
    }

    #[tokio::test]
    async fn test_first_signal_stops_runner() {
        let stop = StopHandle::new();
        let mut repeated = None;

        watch_signals(stream::iter(["SIGTERM"]), stop.clone(), |signal| {
            repeated = Some(signal)
        })
        .await;

        assert!(stop.is_stopped());
        assert_eq!(repeated, None);
    }

    #[tokio::test]
    async fn test_second_signal_exits() {
        let stop = StopHandle::new();
        let mut repeated = None;

        watch_signals(stream::iter(["SIGINT", "SIGHUP"]), stop.clone(), |signal| {
            repeated = Some(signal)
        })
        .await;

        assert!(stop.is_stopped());
        assert_eq!(repeated, Some("SIGHUP"));
    }
}
