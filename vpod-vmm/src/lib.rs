//! vpod-vmm - per-VM runtime core for the vpod daemon.
//!
//! Every pod VM is owned by an event-loop coordinator that joins three
//! independently-paced conversations: the JSON monitor protocol spoken by the
//! hypervisor, the framed init channel spoken by the guest, and host-side
//! device preparation (thin snapshots, tap interfaces, the shared 9p dir).
//! The coordinator is the only owner of per-VM state; everything else talks
//! to it through typed channels.

pub mod channel;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod hypervisor;
pub mod monitor;
pub mod pod;
pub mod vm;
