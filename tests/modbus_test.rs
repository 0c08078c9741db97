use pvctl::modbus::transport::MemoryTransport;
use pvctl::modbus::{
    FunctionCode, RegisterDescriptor, RetryPolicy, SlaveDevice, Span, WireType, plan_chunks,
};
use std::sync::Arc;

/// Deterministic pseudo-random register sets
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

fn random_spans(rng: &mut Lcg) -> Vec<Span> {
    let functions = [FunctionCode::Holding, FunctionCode::Input, FunctionCode::Coil];
    (0..1 + rng.next(40))
        .map(|_| Span {
            function: functions[rng.next(3) as usize],
            address: rng.next(400) as u16,
            count: [1, 1, 2, 2, 4][rng.next(5) as usize],
        })
        .collect()
}

#[test]
fn chunk_plan_covers_every_register_within_limits() {
    let mut rng = Lcg(7);
    for round in 0..500 {
        let spans = random_spans(&mut rng);
        let max_regs = 8 + rng.next(120) as u16;
        let hole = rng.next(20) as u16;
        let plan = plan_chunks(&spans, max_regs, 2000, Some(hole));

        let mut seen = vec![0; spans.len()];
        for chunk in &plan {
            let mut end = chunk.start as u32;
            for &m in &chunk.members {
                seen[m] += 1;
                let s = spans[m];
                assert_eq!(s.function, chunk.function, "round {}", round);
                assert!(s.address >= chunk.start);
                assert!(s.address as u32 + s.count as u32 <= chunk.start as u32 + chunk.count as u32);
                assert!(
                    (s.address as u32).saturating_sub(end) <= hole as u32,
                    "round {}: gap above {} in {:?}",
                    round,
                    hole,
                    chunk
                );
                end = end.max(s.address as u32 + s.count as u32);
            }
            let limit = if chunk.function.is_bit() { 2000 } else { max_regs };
            assert!(chunk.count <= limit || chunk.members.len() == 1);
        }
        assert!(seen.iter().all(|&n| n == 1), "round {}: {:?}", round, seen);
    }
}

#[test]
fn chunk_plan_is_deterministic() {
    let mut rng = Lcg(42);
    let spans = random_spans(&mut rng);
    assert_eq!(
        plan_chunks(&spans, 64, 2000, None),
        plan_chunks(&spans, 64, 2000, None)
    );
}

fn table() -> Vec<RegisterDescriptor> {
    let h = RegisterDescriptor::holding;
    vec![
        h("voltage", 0, WireType::U16).scaled(0.1, 1),
        h("power", 2, WireType::I32),
        h("energy", 10, WireType::U32).scaled(0.01, 2),
        h("far", 300, WireType::U16),
        h("limit", 400, WireType::U16),
    ]
}

#[tokio::test]
async fn slave_reads_table_in_planned_chunks() {
    let bus = Arc::new(MemoryTransport::new());
    bus.set_words(1, FunctionCode::Holding, 0, &[2301]);
    bus.set_words(1, FunctionCode::Holding, 2, &[0xFFFF, 0xFC18]);
    bus.set_words(1, FunctionCode::Holding, 10, &[0, 12345]);
    bus.set_words(1, FunctionCode::Holding, 300, &[7]);
    let mut dev = SlaveDevice::new("meter", 1, bus.clone(), table(), RetryPolicy::default()).unwrap();

    dev.read(&["voltage", "power", "energy", "far"]).await.unwrap();
    assert!((dev.value("voltage").unwrap() - 230.1).abs() < 1e-9);
    assert_eq!(dev.value("power"), Some(-1000.0));
    assert!((dev.value("energy").unwrap() - 123.45).abs() < 1e-9);
    assert_eq!(dev.value("far"), Some(7.0));
    // The first three registers share one request; 300 is too far away
    assert_eq!(bus.transactions().len(), 2);
    assert!(dev.is_online());
}

#[tokio::test]
async fn write_if_changed_skips_identical_values() {
    let bus = Arc::new(MemoryTransport::new());
    let mut dev = SlaveDevice::new("evse", 1, bus.clone(), table(), RetryPolicy::default()).unwrap();

    assert!(dev.write_if_changed("limit", 16.0).await.unwrap());
    assert!(!dev.write_if_changed("limit", 16.0).await.unwrap());
    assert!(dev.write_if_changed("limit", 10.0).await.unwrap());
    assert_eq!(bus.transactions().len(), 2);
    assert_eq!(bus.word(1, FunctionCode::Holding, 400), 10);
}

#[tokio::test]
async fn dead_unit_goes_offline_and_keeps_values() {
    let bus = Arc::new(MemoryTransport::new());
    bus.set_words(1, FunctionCode::Holding, 0, &[2300]);
    let mut dev = SlaveDevice::new("meter", 1, bus.clone(), table(), RetryPolicy::default()).unwrap();
    dev.read(&["voltage"]).await.unwrap();

    bus.set_dead(1, true);
    assert!(dev.read(&["voltage"]).await.is_err());
    assert!(!dev.is_online());
}
