//! In-process network adapter.
//!
//! [`LoopbackNet`] implements [`ZclTransport`] and [`NetworkPort`] by
//! recording what the engine sends.  The simulation (or a test) drains the
//! outbox and decides when, and whether, each frame reaches its peer.

use log::debug;

use crate::app::ports::{NetworkPort, ZclTransport};
use crate::error::TransportError;
use crate::protocol::{FrameBuf, PeerAddr};

/// A ZDO request the engine asked the network to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZdoRequest {
    MatchDesc { cluster_id: u16 },
    IeeeAddr { short_addr: u16 },
}

#[derive(Debug, Default)]
pub struct LoopbackNet {
    short_addr: u16,
    outbox: Vec<(PeerAddr, FrameBuf)>,
    zdo: Vec<ZdoRequest>,
    match_desc_count: u32,
    /// Refuse every send (link down).
    link_down: bool,
}

impl LoopbackNet {
    pub fn new(short_addr: u16) -> Self {
        Self {
            short_addr,
            ..Self::default()
        }
    }

    pub fn short_addr(&self) -> u16 {
        self.short_addr
    }

    pub fn set_link_down(&mut self, down: bool) {
        self.link_down = down;
    }

    /// Frames sent and not yet drained.
    pub fn outbox(&self) -> &[(PeerAddr, FrameBuf)] {
        &self.outbox
    }

    pub fn take_outbox(&mut self) -> Vec<(PeerAddr, FrameBuf)> {
        core::mem::take(&mut self.outbox)
    }

    /// Nothing sent that has not been drained yet.
    pub fn is_idle(&self) -> bool {
        self.outbox.is_empty() && self.zdo.is_empty()
    }

    pub fn take_zdo(&mut self) -> Vec<ZdoRequest> {
        core::mem::take(&mut self.zdo)
    }

    /// Match-descriptor requests issued since creation.
    pub fn match_desc_requests(&self) -> u32 {
        self.match_desc_count
    }

    fn check_link(&self) -> Result<(), TransportError> {
        if self.link_down {
            Err(TransportError::NoRoute)
        } else {
            Ok(())
        }
    }
}

impl ZclTransport for LoopbackNet {
    fn send(&mut self, dst: PeerAddr, frame: &[u8]) -> Result<(), TransportError> {
        self.check_link()?;
        let frame = FrameBuf::from_slice(frame).map_err(|()| TransportError::Busy)?;
        debug!(
            "Loopback: 0x{:04X} -> 0x{:04X} ({} bytes)",
            self.short_addr,
            dst.short_addr,
            frame.len()
        );
        self.outbox.push((dst, frame));
        Ok(())
    }
}

impl NetworkPort for LoopbackNet {
    fn match_desc_req(&mut self, cluster_id: u16) -> Result<(), TransportError> {
        self.check_link()?;
        self.match_desc_count += 1;
        self.zdo.push(ZdoRequest::MatchDesc { cluster_id });
        Ok(())
    }

    fn ieee_addr_req(&mut self, short_addr: u16) -> Result<(), TransportError> {
        self.check_link()?;
        self.zdo.push(ZdoRequest::IeeeAddr { short_addr });
        Ok(())
    }
}
