use std::{sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};
use esim_core::{
    bridge::{serve_bridge, SyncBridge},
    endpoint::{ProvisioningEndpoint, BIND_CARRIER_PROVISIONING_SERVICE},
    machine::AttemptSummary,
    page::PAGE_BRIDGE_SCRIPT,
    platform::{SimulatedPlatform, RESULT_CANCELED, RESULT_OK},
    ActivationCodeStore, AttemptState, EsimConfig, EventBus, Provisioner, Subscription,
};
use esim_telemetry::EventRecorder;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "esim", version, about = "eSIM provisioning bridge driver")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Ask whether the simulated device supports eSIM
    Check {
        #[command(flatten)]
        platform: PlatformArgs,
        /// Supported device models (iOS only)
        #[arg(long = "supported-model")]
        models: Vec<String>,
    },
    /// Run one installation attempt end to end
    Install {
        #[command(flatten)]
        platform: PlatformArgs,
        /// Activation code, e.g. LPA:1$smdp.example.com$MATCHING-ID
        code: String,
        /// Result the OS activation UI reports: ok, canceled, or a number
        #[arg(long, default_value = "ok", value_parser = parse_result_code)]
        result: i32,
    },
    /// Call a method through the synchronous page bridge
    Bridge {
        #[command(flatten)]
        platform: PlatformArgs,
        method: String,
        /// JSON argument text
        args: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Leave the coordinator stopped to observe the timeout path
        #[arg(long)]
        stall: bool,
    },
    /// Open the vendor universal link for a code
    Link {
        #[command(flatten)]
        platform: PlatformArgs,
        code: String,
    },
    /// Print manual installation steps
    Instructions {
        #[command(flatten)]
        platform: PlatformArgs,
    },
    /// Print the script injected into the embedded page
    Script,
    /// Show the effective configuration
    Config {
        /// Write it back to the state dir
        #[arg(long)]
        save: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OsArg {
    Android,
    Ios,
}

#[derive(Args, Clone)]
struct PlatformArgs {
    #[arg(long, value_enum, default_value_t = OsArg::Android)]
    os: OsArg,
    /// SDK level on Android, major version on iOS
    #[arg(long, default_value_t = 34)]
    sdk: u32,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    no_euicc: bool,
    #[arg(long)]
    euicc_disabled: bool,
    /// No settings screen resolves
    #[arg(long)]
    no_settings: bool,
    #[arg(long)]
    launch_error: Option<String>,
    /// No foreground activity to launch the activation UI from
    #[arg(long)]
    no_activity: bool,
}

impl PlatformArgs {
    fn build(&self) -> SimulatedPlatform {
        let mut platform = match self.os {
            OsArg::Android => SimulatedPlatform::android(self.sdk),
            OsArg::Ios => SimulatedPlatform::ios(self.sdk),
        };
        if let Some(model) = &self.model {
            platform = platform.with_model(model);
        }
        if self.euicc_disabled {
            platform = platform.with_euicc_enabled(false);
        }
        if self.no_euicc {
            platform = platform.without_euicc();
        }
        if self.no_settings {
            platform = platform.with_resolvable(&[]);
        }
        if let Some(message) = &self.launch_error {
            platform = platform.with_launch_error(message);
        }
        if self.no_activity {
            platform = platform.without_activity();
        }
        platform
    }
}

fn parse_result_code(value: &str) -> Result<i32, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "ok" => Ok(RESULT_OK),
        "canceled" | "cancelled" => Ok(RESULT_CANCELED),
        other => other
            .parse::<i32>()
            .map_err(|_| format!("expected ok, canceled, or an integer, got {value:?}")),
    }
}

/// One provisioner wired to a simulated device, with events echoed to stdout.
struct Session {
    provisioner: Arc<Provisioner>,
    printer: Subscription,
    printer_task: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    recorder: Option<EventRecorder>,
}

impl Session {
    fn open(platform: &PlatformArgs, config: &EsimConfig) -> Self {
        let bus = EventBus::new();
        let store = Arc::new(ActivationCodeStore::new(config.code_retention()));
        let provisioner = Arc::new(Provisioner::new(
            Arc::new(platform.build()),
            bus.clone(),
            store,
            config.clone(),
        ));

        let (printer, mut events) = bus.subscribe_stream();
        let printer_task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                println!("{}", event.to_message());
            }
        });
        let recorder = config
            .event_log
            .then(|| EventRecorder::start(&bus, "esim-cli"));
        if let Some(recorder) = &recorder {
            info!("recording events to {}", recorder.path().display());
        }
        let sweeper = provisioner.spawn_retention_sweeper(config.sweep_interval());

        Self {
            provisioner,
            printer,
            printer_task,
            sweeper,
            recorder,
        }
    }

    async fn close(self) -> Option<AttemptSummary> {
        let summary = self.provisioner.last_outcome();
        self.sweeper.abort();
        drop(self.printer);
        if let Err(err) = self.printer_task.await {
            warn!("event printer failed: {err}");
        }
        if let Some(recorder) = self.recorder {
            let dropped = recorder.dropped();
            if dropped > 0 {
                warn!("{dropped} event(s) were not recorded");
            }
            recorder.finish();
        }
        summary
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    esim_util::init_tracing()?;
    let cli = Cli::parse();
    let config = EsimConfig::load();

    match cli.cmd {
        Cmd::Check { platform, models } => {
            let session = Session::open(&platform, &config);
            let supported = session.provisioner.is_support_esim(&models);
            session.close().await;
            match supported {
                Ok(supported) => println!("isSupportESim -> {supported}"),
                Err(err) => println!("isSupportESim -> {} ({err})", err.code()),
            }
        }
        Cmd::Install {
            platform,
            code,
            result,
        } => {
            let session = Session::open(&platform, &config);
            let provisioner = Arc::clone(&session.provisioner);
            let installed = provisioner.install_esim_profile(&code);

            let awaiting = provisioner
                .active_attempt()
                .is_some_and(|attempt| attempt.state == AttemptState::AwaitingOsResult);
            if awaiting {
                let endpoint = ProvisioningEndpoint::new(
                    Arc::clone(provisioner.store()),
                    Arc::clone(provisioner.bus()),
                );
                endpoint.on_create();
                endpoint.on_bind(Some(BIND_CARRIER_PROVISIONING_SERVICE));
                match endpoint.get_activation_code() {
                    Ok(code) => info!("OS pulled a {}-character code", code.char_len()),
                    Err(err) => warn!("OS pull failed: {err}"),
                }
                endpoint.on_destroy();
                provisioner.on_activity_result(provisioner.config().request_code, result, &[]);
            }

            let summary = session.close().await;
            match installed {
                Ok(installed) => println!("installEsimProfile -> {installed}"),
                Err(err) => println!("installEsimProfile -> {} ({err})", err.code()),
            }
            if let Some(summary) = summary {
                println!("attempt {} finished: {}", summary.id, summary.state.as_str());
            }
        }
        Cmd::Bridge {
            platform,
            method,
            args,
            timeout_ms,
            stall,
        } => {
            let session = Session::open(&platform, &config);
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.bridge_timeout());
            let (bridge, inbox) = SyncBridge::new(Arc::clone(session.provisioner.bus()), timeout);
            info!("bridge calls wait at most {}ms", bridge.timeout().as_millis());

            let (coordinator, _held_inbox) = if stall {
                (None, Some(inbox))
            } else {
                let task = tokio::spawn(serve_bridge(inbox, Arc::clone(&session.provisioner)));
                (Some(task), None)
            };

            let envelope = tokio::task::spawn_blocking(move || {
                bridge.call_synchronously(&method, args.as_deref())
            })
            .await?;
            if let Some(coordinator) = coordinator {
                coordinator.await?;
            }

            session.close().await;
            println!("{envelope}");
        }
        Cmd::Link { platform, code } => {
            let session = Session::open(&platform, &config);
            let opened = session.provisioner.open_universal_link(&code);
            session.close().await;
            match opened {
                Ok(opened) => println!("openUniversalLink -> {opened}"),
                Err(err) => println!("openUniversalLink -> {} ({err})", err.code()),
            }
        }
        Cmd::Instructions { platform } => {
            let session = Session::open(&platform, &config);
            let text = session.provisioner.instructions();
            session.close().await;
            println!("{text}");
        }
        Cmd::Script => {
            print!("{PAGE_BRIDGE_SCRIPT}");
        }
        Cmd::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config.save()?;
                println!("saved to {}", esim_core::config::config_path().display());
            }
        }
    }

    Ok(())
}
