//! Fake smartmeter served to an inverter's meter port
//!
//! The inverter polls us as if we were its grid meter. The values come from
//! the aggregator; when they go stale the served active power drops to zero,
//! and past the abort threshold we stop answering so the inverter falls back
//! to its own safe mode.

use crate::config::{FakeMeterClass, FakeMeterConfig, FakeMeterPortConfig};
use crate::devices::local_meter;
use crate::error::{PvError, Result};
use crate::logging::{StructuredLogger, get_logger_for};
use crate::modbus::transport::serial_builder;
use crate::modbus::{LocalServer, RegisterDescriptor, WireType};
use crate::mqtt::Mqtt;
use serde::Serialize;
use std::future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_modbus::prelude::*;
use tokio_modbus::server::rtu::Server;
use tokio_serial::SerialStream;
use tokio_util::sync::CancellationToken;

/// Upper edges of the lag histogram buckets (ms); the last bucket is open
pub const LAG_BUCKETS_MS: [u64; 4] = [50, 100, 200, 500];

/// What to do with a request given the age of the served data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Serve,
    /// Serve with active power forced to zero
    ZeroPower,
    Refuse,
}

/// Freshness decision; `age` is `None` before the first update
pub fn freshness(age: Option<Duration>, online: bool, ignore: Duration, abort: Duration) -> Freshness {
    match age {
        _ if !online => Freshness::Refuse,
        None => Freshness::Refuse,
        Some(a) if a > abort => Freshness::Refuse,
        Some(a) if a > ignore => Freshness::ZeroPower,
        Some(_) => Freshness::Serve,
    }
}

/// Served register layout of a meter class
pub fn register_table(class: FakeMeterClass) -> Vec<RegisterDescriptor> {
    match class {
        FakeMeterClass::EastronSdm120 => local_meter::register_table(),
        FakeMeterClass::AcrelAcr10r => {
            let h = RegisterDescriptor::holding;
            vec![
                h("voltage", 0x0000, WireType::U16).scaled(0.1, 1),
                h("current", 0x0001, WireType::U16).scaled(0.01, 2),
                h("active_power", 0x0002, WireType::I32),
                h("reactive_power", 0x0004, WireType::I32),
                h("apparent_power", 0x0006, WireType::I32),
                h("power_factor", 0x0008, WireType::I16).scaled(0.001, 3),
                h("frequency", 0x0009, WireType::U16).scaled(0.01, 2),
                h("import_energy", 0x000A, WireType::U32).scaled(0.01, 2),
                h("export_energy", 0x000C, WireType::U32).scaled(0.01, 2),
            ]
        }
    }
}

/// Values written by the aggregator each cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FakeMeterValues {
    pub active_power: f64,
    pub voltage: f64,
    pub current: f64,
    pub apparent_power: f64,
    pub reactive_power: f64,
    pub power_factor: f64,
    pub frequency: f64,
    pub import_energy: f64,
    pub export_energy: f64,
}

impl FakeMeterValues {
    fn fields(&self) -> [(&'static str, f64); 9] {
        [
            ("active_power", self.active_power),
            ("voltage", self.voltage),
            // Unsigned on some layouts; the sign is carried by the power
            ("current", self.current.abs()),
            ("apparent_power", self.apparent_power),
            ("reactive_power", self.reactive_power),
            ("power_factor", self.power_factor),
            ("frequency", self.frequency),
            ("import_energy", self.import_energy),
            ("export_energy", self.export_energy),
        ]
    }
}

/// Per-request hook consulted before serving
///
/// Replaced on configuration reload without restarting the server.
pub trait RequestPolicy: Send + Sync {
    fn allow(&self, meter: &str, request: &Request<'_>) -> bool;
}

impl<F> RequestPolicy for F
where
    F: Fn(&str, &Request<'_>) -> bool + Send + Sync,
{
    fn allow(&self, meter: &str, request: &Request<'_>) -> bool {
        self(meter, request)
    }
}

/// Default policy: serve unless the maintenance switch is on
#[derive(Debug, Clone, Copy)]
pub struct MaintenancePolicy {
    pub refuse_all: bool,
}

impl RequestPolicy for MaintenancePolicy {
    fn allow(&self, _meter: &str, _request: &Request<'_>) -> bool {
        !self.refuse_all
    }
}

/// Request counters since the last publication
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestStats {
    pub requests: u64,
    pub refused: u64,
    pub stale_errors: u64,
    pub lag_sum_ms: f64,
    pub lag_max_ms: f64,
    pub lag_histogram: [u64; 5],
}

impl RequestStats {
    fn record_lag(&mut self, lag: Duration) {
        let ms = lag.as_secs_f64() * 1000.0;
        self.lag_sum_ms += ms;
        self.lag_max_ms = self.lag_max_ms.max(ms);
        let bucket = LAG_BUCKETS_MS
            .iter()
            .position(|&edge| (lag.as_millis() as u64) < edge)
            .unwrap_or(LAG_BUCKETS_MS.len());
        self.lag_histogram[bucket] += 1;
    }

    pub fn served(&self) -> u64 {
        self.requests - self.refused
    }

    pub fn mean_lag_ms(&self) -> f64 {
        match self.served() {
            0 => 0.0,
            n => self.lag_sum_ms / n as f64,
        }
    }
}

/// Register image plus freshness bookkeeping for one inverter
pub struct FakeMeter {
    name: String,
    server: LocalServer,
    data_timestamp: Option<Instant>,
    is_online: bool,
    last_query: Option<Instant>,
    ignore: Duration,
    abort: Duration,
    policy: Arc<dyn RequestPolicy>,
    stats: RequestStats,
    state: Freshness,
    logger: StructuredLogger,
}

impl FakeMeter {
    pub fn new(name: &str, port: &FakeMeterPortConfig, cfg: &FakeMeterConfig) -> Result<Self> {
        let server = LocalServer::new(port.unit_id, register_table(port.meter_class))?;
        Ok(Self {
            name: name.to_string(),
            server,
            data_timestamp: None,
            is_online: false,
            last_query: None,
            ignore: Duration::from_secs_f64(cfg.max_age_ignore_s),
            abort: Duration::from_secs_f64(cfg.max_age_abort_s),
            policy: Arc::new(MaintenancePolicy {
                refuse_all: cfg.refuse_all,
            }),
            stats: RequestStats::default(),
            state: Freshness::Refuse,
            logger: get_logger_for("fake_meter", name),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit_id(&self) -> u8 {
        self.server.unit_id()
    }

    pub fn is_online(&self) -> bool {
        self.is_online
    }

    pub fn data_timestamp(&self) -> Option<Instant> {
        self.data_timestamp
    }

    /// Time of the last request addressed to us, served or not
    pub fn last_query(&self) -> Option<Instant> {
        self.last_query
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.server.value(name)
    }

    pub fn stats(&self) -> &RequestStats {
        &self.stats
    }

    /// Return the counters and start a new period
    pub fn take_stats(&mut self) -> RequestStats {
        std::mem::take(&mut self.stats)
    }

    pub fn set_policy(&mut self, policy: Arc<dyn RequestPolicy>) {
        self.policy = policy;
    }

    /// Apply reloaded thresholds and the default policy
    pub fn reconfigure(&mut self, cfg: &FakeMeterConfig) {
        self.ignore = Duration::from_secs_f64(cfg.max_age_ignore_s);
        self.abort = Duration::from_secs_f64(cfg.max_age_abort_s);
        self.policy = Arc::new(MaintenancePolicy {
            refuse_all: cfg.refuse_all,
        });
    }

    /// New values from the aggregator
    ///
    /// `timestamp` is the meter transaction the values derive from, not the
    /// time of this call. A value that does not fit the layout rejects the
    /// whole update; the previous values then age out.
    pub fn update(&mut self, values: &FakeMeterValues, timestamp: Option<Instant>, online: bool) -> Result<()> {
        let fields: Vec<(&str, Option<f64>)> = values
            .fields()
            .into_iter()
            .map(|(name, v)| (name, Some(v)))
            .collect();
        self.server.set_all(&fields)?;
        self.data_timestamp = timestamp;
        self.is_online = online;
        Ok(())
    }

    pub fn set_offline(&mut self) {
        self.is_online = false;
    }

    /// Answer one request; `Ok(None)` refuses it without a reply
    pub fn handle(
        &mut self,
        request: &Request<'_>,
        now: Instant,
    ) -> std::result::Result<Option<Response>, ExceptionCode> {
        self.last_query = Some(now);
        self.stats.requests += 1;
        if !self.policy.allow(&self.name, request) {
            self.stats.refused += 1;
            return Ok(None);
        }

        let age = self.data_timestamp.map(|t| now.saturating_duration_since(t));
        let decision = freshness(age, self.is_online, self.ignore, self.abort);
        self.note_transition(decision, age);
        match decision {
            Freshness::Refuse => {
                if age.is_some_and(|a| a > self.abort) {
                    self.is_online = false;
                }
                self.stats.refused += 1;
                Ok(None)
            }
            Freshness::ZeroPower => {
                self.stats.stale_errors += 1;
                self.stats.record_lag(age.unwrap_or_default());
                self.server.answer(request, &[("active_power", 0.0)]).map(Some)
            }
            Freshness::Serve => {
                self.stats.record_lag(age.unwrap_or_default());
                self.server.answer(request, &[]).map(Some)
            }
        }
    }

    fn note_transition(&mut self, next: Freshness, age: Option<Duration>) {
        if next == self.state {
            return;
        }
        let age_ms = age.map(|a| a.as_millis()).unwrap_or_default();
        match next {
            Freshness::Serve => self.logger.info("Serving fresh data"),
            Freshness::ZeroPower => self.logger.warn(
                &PvError::stale(format!("data is {} ms old, serving zero power", age_ms)).to_string(),
            ),
            Freshness::Refuse => self
                .logger
                .warn(&format!("Refusing requests (online={}, age={} ms)", self.is_online, age_ms)),
        }
        self.state = next;
    }
}

/// Fake meter shared between its server task and the aggregator
///
/// The lock is never held across an await.
#[derive(Clone)]
pub struct FakeMeterHandle(Arc<Mutex<FakeMeter>>);

impl FakeMeterHandle {
    pub fn new(meter: FakeMeter) -> Self {
        Self(Arc::new(Mutex::new(meter)))
    }

    pub fn lock(&self) -> MutexGuard<'_, FakeMeter> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// tokio-modbus service answering for one unit address
pub struct FakeMeterService {
    unit_id: u8,
    meter: FakeMeterHandle,
}

impl FakeMeterService {
    pub fn new(meter: FakeMeterHandle) -> Self {
        let unit_id = meter.lock().unit_id();
        Self { unit_id, meter }
    }
}

impl tokio_modbus::server::Service for FakeMeterService {
    type Request = SlaveRequest<'static>;
    type Response = Option<Response>;
    type Exception = ExceptionCode;
    type Future = future::Ready<std::result::Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        // Other units share the line with us on some installations
        if req.slave != self.unit_id {
            return future::ready(Ok(None));
        }
        let result = self.meter.lock().handle(&req.request, Instant::now());
        future::ready(result)
    }
}

/// RTU server bound to one inverter's meter port
///
/// Opened at startup so a missing port is a startup error; it then keeps
/// running across configuration reloads.
pub struct FakeMeterServer {
    server: Server,
    meter: FakeMeterHandle,
    port: String,
    logger: StructuredLogger,
}

impl FakeMeterServer {
    pub fn open(port: &FakeMeterPortConfig, meter: FakeMeterHandle) -> Result<Self> {
        let builder = serial_builder(&port.serial)?;
        let stream = SerialStream::open(&builder).map_err(|e| {
            PvError::transport(format!("Cannot open {}: {}", port.serial.port, e))
        })?;
        let logger = get_logger_for("fake_meter", meter.lock().name());
        Ok(Self {
            server: Server::new(stream),
            meter,
            port: port.serial.port.clone(),
            logger,
        })
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let Self {
            server,
            meter,
            port,
            logger,
        } = self;
        logger.info(&format!("Serving meter on {}", port));
        let service = FakeMeterService::new(meter);
        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            r = server.serve_forever(service) => {
                r.map(|_| ()).map_err(|e| PvError::transport(format!("{}: {}", port, e)))
            }
        }
    }
}

/// Publish request statistics of several meters once per `period`
pub async fn run_stats_publisher(
    meters: Vec<FakeMeterHandle>,
    mqtt: Mqtt,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(period);
    // The first tick completes immediately
    tick.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                for meter in &meters {
                    let (name, stats) = {
                        let mut m = meter.lock();
                        (m.name().to_string(), m.take_stats())
                    };
                    publish_stats(&mqtt, &name, &stats, period).await;
                }
            }
        }
    }
}

pub async fn publish_stats(mqtt: &Mqtt, name: &str, stats: &RequestStats, period: Duration) {
    let t = |s: &str| format!("pv/{}/fakemeter/{}", name, s);
    let rate = stats.requests as f64 / period.as_secs_f64().max(1.0);
    mqtt.publish_text(&t("request_rate"), &crate::mqtt::format_number(rate))
        .await;
    mqtt.publish_text(&t("lag_mean_ms"), &crate::mqtt::format_number(stats.mean_lag_ms()))
        .await;
    mqtt.publish_text(&t("lag_max_ms"), &crate::mqtt::format_number(stats.lag_max_ms))
        .await;
    mqtt.publish_text(&t("stale_errors"), &stats.stale_errors.to_string())
        .await;
    mqtt.publish_text(&t("refused"), &stats.refused.to_string())
        .await;
    if let Ok(v) = serde_json::to_value(stats.lag_histogram) {
        mqtt.publish_json(&t("lag_histogram"), &v).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IGNORE: Duration = Duration::from_secs(1);
    const ABORT: Duration = Duration::from_secs(5);

    fn meter(class: FakeMeterClass) -> FakeMeter {
        let port = FakeMeterPortConfig {
            meter_class: class,
            ..Default::default()
        };
        FakeMeter::new("solis1", &port, &FakeMeterConfig::default()).unwrap()
    }

    fn values(power: f64) -> FakeMeterValues {
        FakeMeterValues {
            active_power: power,
            voltage: 231.5,
            current: -4.2,
            frequency: 50.01,
            power_factor: 0.98,
            import_energy: 1234.56,
            ..Default::default()
        }
    }

    #[test]
    fn test_freshness_thresholds() {
        let f = |ms| freshness(Some(Duration::from_millis(ms)), true, IGNORE, ABORT);
        assert_eq!(f(0), Freshness::Serve);
        assert_eq!(f(1000), Freshness::Serve);
        assert_eq!(f(1001), Freshness::ZeroPower);
        assert_eq!(f(5000), Freshness::ZeroPower);
        assert_eq!(f(5001), Freshness::Refuse);
        assert_eq!(freshness(None, true, IGNORE, ABORT), Freshness::Refuse);
        assert_eq!(
            freshness(Some(Duration::ZERO), false, IGNORE, ABORT),
            Freshness::Refuse
        );
    }

    #[test]
    fn test_acrel_layout_encoding() {
        let mut m = meter(FakeMeterClass::AcrelAcr10r);
        let t0 = Instant::now();
        m.update(&values(-950.0), Some(t0), true).unwrap();
        let r = m.handle(&Request::ReadHoldingRegisters(0, 4), t0).unwrap();
        // 231.5 V, 4.2 A, -950 W as I32
        assert_eq!(
            r,
            Some(Response::ReadHoldingRegisters(vec![2315, 420, 0xFFFF, (-950i32 as u32 & 0xFFFF) as u16]))
        );
    }

    #[test]
    fn test_update_is_all_or_nothing() {
        let mut m = meter(FakeMeterClass::AcrelAcr10r);
        let t0 = Instant::now();
        m.update(&values(-950.0), Some(t0), true).unwrap();

        // Export energy is the last field and overflows the U32 layout
        let mut bad = values(-400.0);
        bad.export_energy = 1e9;
        let t1 = t0 + Duration::from_millis(500);
        assert!(m.update(&bad, Some(t1), true).is_err());
        assert_eq!(m.value("active_power"), Some(-950.0));
        assert_eq!(m.data_timestamp(), Some(t0));
    }

    #[test]
    fn test_stale_data_zeroes_power_then_refuses() {
        let mut m = meter(FakeMeterClass::EastronSdm120);
        let t0 = Instant::now();
        m.update(&values(-2000.0), Some(t0), true).unwrap();
        let req = Request::ReadInputRegisters(0x0C, 2);

        let fresh = m.handle(&req, t0 + Duration::from_millis(200)).unwrap();
        assert_eq!(
            fresh,
            Some(Response::ReadInputRegisters(
                crate::modbus::encode_32bit_float(-2000.0).to_vec()
            ))
        );

        let stale = m.handle(&req, t0 + Duration::from_secs(3)).unwrap();
        assert_eq!(stale, Some(Response::ReadInputRegisters(vec![0, 0])));
        assert_eq!(m.stats().stale_errors, 1);

        assert_eq!(m.handle(&req, t0 + Duration::from_secs(6)).unwrap(), None);
        assert!(!m.is_online());
        // Stays refused until the aggregator brings it back
        assert_eq!(m.handle(&req, t0 + Duration::from_secs(6)).unwrap(), None);
        let t1 = t0 + Duration::from_secs(7);
        m.update(&values(-1000.0), Some(t1), true).unwrap();
        assert!(m.handle(&req, t1).unwrap().is_some());
    }

    #[test]
    fn test_policy_and_writes_refused() {
        let mut m = meter(FakeMeterClass::EastronSdm120);
        let t0 = Instant::now();
        m.update(&values(100.0), Some(t0), true).unwrap();
        assert_eq!(
            m.handle(&Request::WriteSingleRegister(0, 1), t0),
            Err(ExceptionCode::IllegalFunction)
        );
        fn no_frequency(_: &str, r: &Request<'_>) -> bool {
            !matches!(r, Request::ReadInputRegisters(0x46, _))
        }
        m.set_policy(Arc::new(no_frequency));
        assert_eq!(m.handle(&Request::ReadInputRegisters(0x46, 2), t0).unwrap(), None);
        assert!(m.handle(&Request::ReadInputRegisters(0x0C, 2), t0).unwrap().is_some());
        m.reconfigure(&FakeMeterConfig {
            refuse_all: true,
            ..Default::default()
        });
        assert_eq!(m.handle(&Request::ReadInputRegisters(0x0C, 2), t0).unwrap(), None);
        assert!(m.last_query().is_some());
    }

    #[test]
    fn test_lag_histogram() {
        let mut m = meter(FakeMeterClass::EastronSdm120);
        let t0 = Instant::now();
        m.update(&values(0.0), Some(t0), true).unwrap();
        let req = Request::ReadInputRegisters(0, 2);
        for ms in [10, 60, 150, 300, 800] {
            m.handle(&req, t0 + Duration::from_millis(ms)).unwrap();
        }
        let s = m.take_stats();
        assert_eq!(s.lag_histogram, [1, 1, 1, 1, 1]);
        assert_eq!(s.requests, 5);
        assert!((s.mean_lag_ms() - 264.0).abs() < 1e-6);
        assert_eq!(s.lag_max_ms, 800.0);
        assert_eq!(m.stats().requests, 0);
    }

    #[test]
    fn test_service_ignores_other_units() {
        use tokio_modbus::server::Service;
        let handle = FakeMeterHandle::new(meter(FakeMeterClass::EastronSdm120));
        handle.lock().update(&values(5.0), Some(Instant::now()), true).unwrap();
        let service = FakeMeterService::new(handle.clone());
        let other = SlaveRequest {
            slave: 7,
            request: Request::ReadInputRegisters(0x0C, 2),
        };
        assert_eq!(service.call(other).into_inner(), Ok(None));
        assert!(handle.lock().last_query().is_none());
        let ours = SlaveRequest {
            slave: 1,
            request: Request::ReadInputRegisters(0x0C, 2),
        };
        assert!(matches!(service.call(ours).into_inner(), Ok(Some(_))));
    }
}
