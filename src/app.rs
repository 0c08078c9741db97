//! Process roles and component wiring
//!
//! Every role runs in one process with one MQTT connection. A serial port or
//! CAN socket that cannot be opened fails the start, and whatever was
//! already spawned is aborted. On shutdown the components are stopped first
//! and the broker connection last, so their final publications still go out.

use crate::aggregator::{Aggregator, InverterFeed};
use crate::can::CanBridge;
use crate::config::{Config, SharedConfig};
use crate::devices::{EvseDevice, InverterDriver, LocalMeter, MeterPoller, evse, inverter, local_meter, meter};
use crate::error::{PvError, Result};
use crate::fake_meter::{FakeMeter, FakeMeterHandle, FakeMeterServer, run_stats_publisher};
use crate::logging::{StructuredLogger, get_logger, get_logger_for};
use crate::modbus::{ModbusTransport, RetryPolicy, RtuTransport, SlaveDevice};
use crate::mqtt::Mqtt;
use crate::router::{EvseLink, Router};
use crate::supervisor::{Supervisor, supervise};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Meter, inverters, fake meters and the aggregator
    Controller,
    /// Surplus router with the EVSE
    Router,
    CanBridge,
    All,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Controller => "controller",
            Role::Router => "router",
            Role::CanBridge => "canbridge",
            Role::All => "all",
        }
    }

    fn runs(self, part: Role) -> bool {
        self == Role::All || self == part
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = PvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "controller" => Ok(Role::Controller),
            "router" => Ok(Role::Router),
            "canbridge" | "can" => Ok(Role::CanBridge),
            "all" => Ok(Role::All),
            other => Err(PvError::config(format!(
                "Unknown role '{}', expected controller, router, canbridge or all",
                other
            ))),
        }
    }
}

/// Components of one process
///
/// Built by [`App::start`], which returns an error when a port cannot be
/// opened.
pub struct App {
    role: Role,
    mqtt: Mqtt,
    components: JoinSet<()>,
    connection: JoinSet<()>,
    components_cancel: CancellationToken,
    connection_cancel: CancellationToken,
    logger: StructuredLogger,
}

impl App {
    /// Open every port of `role` and start its components
    pub fn start(role: Role, config: Config, config_path: PathBuf) -> Result<Self> {
        let shared = SharedConfig::new(config);
        let cfg = shared.current();
        let logger = get_logger("app");

        let (mqtt, eventloop) = Mqtt::connect(&cfg.mqtt, role.as_str());
        let connection_cancel = CancellationToken::new();
        let mut connection = JoinSet::new();
        connection.spawn(mqtt.clone().run_event_loop(eventloop, connection_cancel.clone()));
        connection.spawn(mqtt.clone().run_flusher(connection_cancel.clone()));

        let mut app = Self {
            role,
            mqtt,
            components: JoinSet::new(),
            connection,
            components_cancel: CancellationToken::new(),
            connection_cancel,
            logger,
        };
        let mut supervisor = Supervisor::new(shared.clone(), config_path);

        if let Err(e) = app.start_components(&shared, &mut supervisor) {
            // Tasks already spawned must not outlive the failed start
            app.components.abort_all();
            app.connection.abort_all();
            return Err(e);
        }

        app.components
            .spawn(supervisor.run(app.components_cancel.clone()));
        app.logger
            .info(&format!("Role {} started", role));
        Ok(app)
    }

    fn start_components(&mut self, shared: &SharedConfig, supervisor: &mut Supervisor) -> Result<()> {
        if self.role.runs(Role::Controller) {
            self.start_controller(shared, supervisor)?;
        }
        if self.role.runs(Role::Router) {
            self.start_router(shared)?;
        }
        if self.role.runs(Role::CanBridge) {
            self.start_can_bridge(&shared.current(), supervisor)?;
        }
        Ok(())
    }

    fn start_controller(&mut self, shared: &SharedConfig, supervisor: &mut Supervisor) -> Result<()> {
        let cfg = shared.current();
        let cancel = self.components_cancel.clone();

        let transport: Arc<dyn ModbusTransport> = Arc::new(RtuTransport::open(&cfg.meter.serial)?);
        let device = SlaveDevice::new(
            "meter",
            cfg.meter.unit_id,
            transport,
            meter::register_table(),
            RetryPolicy::from_config(&cfg.modbus, &cfg.meter.serial),
        )?;
        let poller = MeterPoller::new(
            device,
            self.mqtt.clone(),
            Duration::from_millis(cfg.meter.poll_interval_ms),
        );
        let meter_rx = poller.subscribe();

        let mut feeds = Vec::new();
        let mut drivers = Vec::new();
        let mut servers = Vec::new();
        for inv in &cfg.inverters {
            let transport: Arc<dyn ModbusTransport> = Arc::new(RtuTransport::open(&inv.serial)?);
            let policy = RetryPolicy::from_config(&cfg.modbus, &inv.serial);
            let device = SlaveDevice::new(
                &inv.name,
                inv.unit_id,
                transport.clone(),
                inverter::register_table(),
                policy.clone(),
            )?;
            let local = LocalMeter::new(SlaveDevice::new(
                &format!("{}_meter", inv.name),
                inv.local_meter_unit_id,
                transport,
                local_meter::register_table(),
                policy,
            )?);
            let driver = InverterDriver::new(inv, device, local, self.mqtt.clone());

            let handle = FakeMeterHandle::new(FakeMeter::new(&inv.name, &inv.fake_meter, &cfg.fake_meter)?);
            servers.push((inv.name.clone(), FakeMeterServer::open(&inv.fake_meter, handle.clone())?));
            feeds.push(InverterFeed {
                readings: driver.subscribe(),
                fake_meter: handle,
            });
            drivers.push(driver);
        }

        // Every port is open; nothing below can fail
        self.components.spawn(poller.run(cancel.clone()));
        for driver in drivers {
            let commands = self
                .mqtt
                .subscribe(&format!("cmnd/pv/{}/+", driver.name()), 16);
            self.components
                .spawn(driver.run(commands, cancel.clone()));
        }
        for (name, server) in servers {
            let logger = get_logger_for("fake_meter", &name);
            let cancel = cancel.clone();
            self.components.spawn(async move {
                if let Err(e) = server.run(cancel).await {
                    logger.error(&format!("Server stopped: {}", e));
                }
            });
        }

        let handles: Vec<FakeMeterHandle> = feeds.iter().map(|f| f.fake_meter.clone()).collect();
        let hook_handles = handles.clone();
        supervisor.on_reload(move |cfg: &Config| {
            for h in &hook_handles {
                h.lock().reconfigure(&cfg.fake_meter);
            }
        });
        self.components.spawn(run_stats_publisher(
            handles,
            self.mqtt.clone(),
            Duration::from_secs(cfg.fake_meter.stats_period_s.max(1)),
            cancel.clone(),
        ));

        let shared = shared.clone();
        let mqtt = self.mqtt.clone();
        self.components.spawn(supervise(
            "aggregator".to_string(),
            Some(supervisor.subscribe()),
            Duration::from_secs(cfg.supervisor.restart_backoff_s),
            cancel,
            move |token| {
                let aggregator = Aggregator::new(
                    &shared.current().aggregator,
                    meter_rx.clone(),
                    feeds.clone(),
                    mqtt.clone(),
                );
                async move {
                    aggregator.run(token).await;
                    Ok(())
                }
            },
        ));
        Ok(())
    }

    fn start_router(&mut self, shared: &SharedConfig) -> Result<()> {
        let cfg = shared.current();
        let link: Option<Box<dyn EvseLink>> = match &cfg.router.evse {
            Some(e) => {
                let transport: Arc<dyn ModbusTransport> = Arc::new(RtuTransport::open(&e.serial)?);
                let policy = RetryPolicy::from_config(&cfg.modbus, &e.serial);
                let device = SlaveDevice::new(
                    "evse",
                    e.unit_id,
                    transport.clone(),
                    evse::register_table(),
                    policy.clone(),
                )?;
                let meter = LocalMeter::new(SlaveDevice::new(
                    "evse_meter",
                    e.meter_unit_id,
                    transport,
                    local_meter::register_table(),
                    policy,
                )?);
                Some(Box::new(EvseDevice::new(device, meter)))
            }
            None => None,
        };
        let router = Router::from_config(shared.clone(), self.mqtt.clone(), link)?;
        self.components
            .spawn(router.run(self.components_cancel.clone()));
        Ok(())
    }

    fn start_can_bridge(&mut self, cfg: &Config, supervisor: &mut Supervisor) -> Result<()> {
        let bridge = CanBridge::open(&cfg.can, self.mqtt.clone())?;
        let control = bridge.control();
        supervisor.on_reload(move |cfg: &Config| control.reconfigure(&cfg.can));
        self.components
            .spawn(bridge.run(self.components_cancel.clone()));
        Ok(())
    }

    /// Stop the components, then flush and close the broker connection
    pub async fn shutdown(mut self) {
        self.logger
            .info(&format!("Stopping role {}", self.role));
        self.components_cancel.cancel();
        while let Some(res) = self.components.join_next().await {
            if let Err(e) = res {
                self.logger.error(&format!("Component panicked: {}", e));
            }
        }
        if let Err(e) = self.mqtt.disconnect().await {
            self.logger.warn(&e.to_string());
        }
        self.connection_cancel.cancel();
        while self.connection.join_next().await.is_some() {}
        self.logger.info("Shutdown complete");
    }
}

/// Start `role` and run it until `shutdown` fires
pub async fn run(role: Role, config: Config, config_path: PathBuf, shutdown: CancellationToken) -> Result<()> {
    let app = App::start(role, config, config_path)?;
    shutdown.cancelled().await;
    app.shutdown().await;
    Ok(())
}
