//! Shared schema types for the northbound and southbound databases.
//!
//! The translation engine and the daemon both speak in these types; neither
//! knows how the snapshots are transported.

#![cfg_attr(test, allow(clippy::unwrap_used))]

#[macro_use]
mod make_id;
mod ethernet;

pub mod nb;
pub mod ops;
pub mod sb;

pub use ethernet::{EthAddr, ParseEthAddrError};

use serde::{Deserialize, Serialize};
use std::fmt;

make_id!(LsId);
make_id!(LspId);
make_id!(LrId);
make_id!(LrpId);
make_id!(AclId);
make_id!(QosId);
make_id!(LbId);
make_id!(DnsId);
make_id!(MeterId);
make_id!(AddressSetId);
make_id!(PortGroupId);
make_id!(HaGroupId);
make_id!(DhcpOptionsId);
