//! CAN interfaces behind a small async seam

use super::frames::RawFrame;
use crate::error::{PvError, Result};
use async_trait::async_trait;
use socketcan::{CanFrame, EmbeddedFrame, Id, StandardId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// One CAN interface with a single reader and a single writer
#[async_trait]
pub trait CanBus: Send + Sync {
    fn name(&self) -> &str;

    /// Next frame from the bus
    async fn recv(&self) -> Result<RawFrame>;

    async fn send(&self, frame: &RawFrame) -> Result<()>;

    /// Close and reopen the interface after an error
    async fn reset(&self) -> Result<()>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// SocketCAN interface (bitrate is configured on the link, not here)
pub struct SocketCanBus {
    interface: String,
    socket: Mutex<Option<Arc<socketcan::tokio::CanSocket>>>,
}

impl SocketCanBus {
    pub fn open(interface: &str) -> Result<Self> {
        let socket = socketcan::tokio::CanSocket::open(interface)
            .map_err(|e| PvError::transport(format!("Cannot open {}: {}", interface, e)))?;
        Ok(Self {
            interface: interface.to_string(),
            socket: Mutex::new(Some(Arc::new(socket))),
        })
    }

    fn socket(&self) -> Result<Arc<socketcan::tokio::CanSocket>> {
        lock(&self.socket)
            .clone()
            .ok_or_else(|| PvError::transport(format!("{} is closed", self.interface)))
    }
}

fn to_raw(frame: CanFrame) -> Result<RawFrame> {
    let CanFrame::Data(data) = frame else {
        return Err(PvError::protocol("remote or error frame"));
    };
    match data.id() {
        Id::Standard(id) => RawFrame::new(id.as_raw(), data.data()),
        Id::Extended(id) => Err(PvError::protocol(format!(
            "unexpected extended id {:#x}",
            id.as_raw()
        ))),
    }
}

fn to_socketcan(frame: &RawFrame) -> Result<CanFrame> {
    let id = StandardId::new(frame.id)
        .ok_or_else(|| PvError::protocol(format!("CAN id {:#x} is not 11-bit", frame.id)))?;
    CanFrame::new(id, &frame.data)
        .ok_or_else(|| PvError::protocol(format!("CAN frame {:#x} too long", frame.id)))
}

#[async_trait]
impl CanBus for SocketCanBus {
    fn name(&self) -> &str {
        &self.interface
    }

    async fn recv(&self) -> Result<RawFrame> {
        let socket = self.socket()?;
        let frame = socket
            .read_frame()
            .await
            .map_err(|e| PvError::transport(format!("{}: {}", self.interface, e)))?;
        to_raw(frame)
    }

    async fn send(&self, frame: &RawFrame) -> Result<()> {
        let socket = self.socket()?;
        socket
            .write_frame(to_socketcan(frame)?)
            .await
            .map_err(|e| PvError::transport(format!("{}: {}", self.interface, e)))
    }

    async fn reset(&self) -> Result<()> {
        *lock(&self.socket) = None;
        let socket = socketcan::tokio::CanSocket::open(&self.interface)
            .map_err(|e| PvError::transport(format!("Cannot reopen {}: {}", self.interface, e)))?;
        *lock(&self.socket) = Some(Arc::new(socket));
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    /// `None` stands for a remote or error frame
    inbound: VecDeque<Option<RawFrame>>,
    sent: Vec<RawFrame>,
    fail_recv: u32,
    fail_send: u32,
    resets: u32,
}

/// In-memory bus: frames are injected by the test and sends are recorded
#[derive(Default)]
pub struct MemoryBus {
    name: String,
    state: Mutex<MemoryState>,
    arrived: Notify,
}

impl MemoryBus {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Queue a frame for the next `recv`
    pub fn inject(&self, frame: RawFrame) {
        lock(&self.state).inbound.push_back(Some(frame));
        self.arrived.notify_one();
    }

    /// Queue a frame that `recv` rejects the way it rejects a CAN error frame
    pub fn inject_error_frame(&self) {
        lock(&self.state).inbound.push_back(None);
        self.arrived.notify_one();
    }

    pub fn sent(&self) -> Vec<RawFrame> {
        lock(&self.state).sent.clone()
    }

    pub fn take_sent(&self) -> Vec<RawFrame> {
        std::mem::take(&mut lock(&self.state).sent)
    }

    /// Fail the next `n` receives with a transport error
    pub fn fail_recv(&self, n: u32) {
        lock(&self.state).fail_recv = n;
        self.arrived.notify_one();
    }

    pub fn fail_send(&self, n: u32) {
        lock(&self.state).fail_send = n;
    }

    pub fn resets(&self) -> u32 {
        lock(&self.state).resets
    }
}

#[async_trait]
impl CanBus for MemoryBus {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&self) -> Result<RawFrame> {
        loop {
            {
                let mut s = lock(&self.state);
                if s.fail_recv > 0 {
                    s.fail_recv -= 1;
                    return Err(PvError::transport(format!("{}: injected error", self.name)));
                }
                if let Some(f) = s.inbound.pop_front() {
                    return f.ok_or_else(|| PvError::protocol("remote or error frame"));
                }
            }
            self.arrived.notified().await;
        }
    }

    async fn send(&self, frame: &RawFrame) -> Result<()> {
        let mut s = lock(&self.state);
        if s.fail_send > 0 {
            s.fail_send -= 1;
            return Err(PvError::transport(format!("{}: injected error", self.name)));
        }
        s.sent.push(frame.clone());
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        lock(&self.state).resets += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socketcan_conversion() {
        let raw = RawFrame::new(0x351, &[1, 2, 3]).unwrap();
        let frame = to_socketcan(&raw).unwrap();
        assert_eq!(to_raw(frame).unwrap(), raw);
    }

    #[tokio::test]
    async fn test_memory_bus_delivers_in_order() {
        let bus = MemoryBus::new("can_bat");
        bus.inject(RawFrame::new(0x355, &[1]).unwrap());
        bus.inject(RawFrame::new(0x356, &[2]).unwrap());
        assert_eq!(bus.recv().await.unwrap().id, 0x355);
        assert_eq!(bus.recv().await.unwrap().id, 0x356);
        bus.fail_recv(1);
        assert!(bus.recv().await.is_err());
        bus.inject_error_frame();
        assert!(matches!(bus.recv().await, Err(PvError::Protocol { .. })));
        bus.send(&RawFrame::new(0x305, &[]).unwrap()).await.unwrap();
        assert_eq!(bus.take_sent().len(), 1);
        assert!(bus.sent().is_empty());
    }
}
