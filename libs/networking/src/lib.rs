//! Guest network identity for the host fleet.
//!
//! Every guest gets a MAC address derived from its slot number. The guest's
//! own network stack turns the last four MAC octets into its IPv4 address,
//! so a MAC of `fc:fc:0a:00:XX:YY` becomes `10.0.XX.YY` inside the VM.
//!
//! # Layout
//!
//! The slot is split at decimal 100:
//!
//! ```text
//! V  = (slot / 100) * 256 + (slot % 100 + 100)
//! XX = V >> 8          (slot / 100)
//! YY = V & 0xff        (100..=199, never 0 or 255)
//! ```
//!
//! Keeping the low octet in `100..=199` means no slot ever maps to a network
//! or broadcast-adjacent host address.

use std::fmt;
use std::net::Ipv4Addr;

use thiserror::Error;

/// Fixed prefix of every guest MAC: `fc:fc` (locally administered) followed
/// by the first two octets of the guest IPv4 range.
pub const GUEST_MAC_PREFIX: [u8; 4] = [0xfc, 0xfc, 0x0a, 0x00];

/// Largest slot whose composite still fits in 16 bits.
pub const MAX_SLOT: u32 = 25_599;

/// Offset added to `slot % 100` to keep the low octet away from 0 and 255.
const LOW_OCTET_OFFSET: u32 = 100;

/// Networking errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// Slot cannot be mapped into the guest address space.
    #[error("invalid slot {slot}: must be at most {max}")]
    InvalidSlot { slot: i64, max: u32 },
}

/// A 48-bit MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Raw octets.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// IPv4 address the guest derives from the last four octets.
    pub fn derived_ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.0[2], self.0[3], self.0[4], self.0[5])
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// Network identity of the guest on a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkIdentity {
    /// Slot the identity was derived from.
    pub slot: u32,
    /// MAC presented to the hypervisor.
    pub mac: MacAddr,
    /// Host-side tap device backing the guest's eth0.
    pub tap_device: String,
}

impl NetworkIdentity {
    /// Derive the full identity for a slot.
    pub fn for_slot(slot: u32) -> Result<Self, NetworkError> {
        Ok(Self {
            slot,
            mac: guest_mac(slot)?,
            tap_device: tap_device_name(slot),
        })
    }

    /// Guest IPv4 address (`10.0.XX.YY`).
    pub fn guest_ip(&self) -> Ipv4Addr {
        self.mac.derived_ipv4()
    }
}

/// Derive the guest MAC for a slot.
pub fn guest_mac(slot: u32) -> Result<MacAddr, NetworkError> {
    let composite = composite(slot)?;
    let [p0, p1, p2, p3] = GUEST_MAC_PREFIX;
    Ok(MacAddr([
        p0,
        p1,
        p2,
        p3,
        (composite >> 8) as u8,
        (composite & 0xff) as u8,
    ]))
}

/// Derive the guest MAC for a signed slot, as stored by external systems.
pub fn guest_mac_checked(slot: i64) -> Result<MacAddr, NetworkError> {
    let slot = u32::try_from(slot).map_err(|_| NetworkError::InvalidSlot {
        slot,
        max: MAX_SLOT,
    })?;
    guest_mac(slot)
}

/// Host-side tap device name for a slot.
pub fn tap_device_name(slot: u32) -> String {
    format!("tap{}", slot)
}

/// The 16-bit value split into the last two MAC octets.
fn composite(slot: u32) -> Result<u16, NetworkError> {
    if slot > MAX_SLOT {
        return Err(NetworkError::InvalidSlot {
            slot: i64::from(slot),
            max: MAX_SLOT,
        });
    }
    let value = (slot / 100) * 256 + (slot % 100 + LOW_OCTET_OFFSET);
    u16::try_from(value).map_err(|_| NetworkError::InvalidSlot {
        slot: i64::from(slot),
        max: MAX_SLOT,
    })
}
