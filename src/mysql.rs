//! MySQL conveniences
//!
//! A MySQL driver's custom-dial hook hands over the raw address string; this
//! module fills in the conventional MySQL endpoints when the sub-address was
//! left off, so `user@bastion` alone reaches the server's local MySQL.

use tokio_util::sync::CancellationToken;

use crate::addr::{SubAddr, TunnelAddr};
use crate::dial::TunnelConn;
use crate::error::DialError;

/// Default the sub-address to `127.0.0.1:3306` when absent, returning the
/// canonical address string.
pub fn normalize_addr(addr: &str) -> Result<String, DialError> {
    let mut target = TunnelAddr::parse(addr)?;
    if target.sub.is_none() {
        target.sub = Some(SubAddr::tcp("127.0.0.1:3306"));
    }
    Ok(target.to_string())
}

/// Dial a MySQL endpoint through the default dialer, normalizing first.
pub async fn dial(addr: &str, cancel: CancellationToken) -> Result<TunnelConn, DialError> {
    let normalized = normalize_addr(addr)?;
    crate::dial_with_cancel(&normalized, cancel).await
}
