//! Protocol handshake: verify the authority's wire version before any sync
//! traffic.
//!
//! The verdict is cached per engine handle with a single in-flight probe;
//! hosts inject the gate where they need isolated worlds (tests create one
//! per world instead of sharing process globals). A mismatch surfaces an
//! actionable error exactly once and keeps sync disabled until restart.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use replicate_types::authority::Authority;
use tokio::sync::OnceCell;

use crate::prelude::*;

/// Lowest wire version this client understands.
pub const PROTOCOL_VERSION_MIN: u32 = 1;
/// Highest wire version this client understands.
pub const PROTOCOL_VERSION_MAX: u32 = 1;

#[derive(Debug, Default)]
pub struct ProtocolGate {
	verified: OnceCell<u32>,
	reported: AtomicBool,
}

impl ProtocolGate {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Query the authority's protocol version once and compare it against the
	/// supported range. Concurrent callers share one probe; the successful
	/// verdict is cached for the life of the gate.
	pub async fn verify(&self, authority: &Arc<dyn Authority>) -> ClResult<u32> {
		let version = self
			.verified
			.get_or_try_init(|| async {
				let info = authority.protocol().await?;
				if info.version < PROTOCOL_VERSION_MIN || info.version > PROTOCOL_VERSION_MAX {
					return Err(Error::ProtocolMismatch {
						client_min: PROTOCOL_VERSION_MIN,
						client_max: PROTOCOL_VERSION_MAX,
						server: info.version,
					});
				}
				debug!("protocol handshake ok (version {})", info.version);
				Ok(info.version)
			})
			.await;
		match version {
			Ok(version) => Ok(*version),
			Err(err) => {
				// Surface the mismatch to the host exactly once; repeats are
				// downgraded to debug noise.
				if matches!(err, Error::ProtocolMismatch { .. })
					&& !self.reported.swap(true, Ordering::AcqRel)
				{
					error!("{}", err);
				}
				Err(err)
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use replicate_types::authority::*;
	use std::sync::atomic::AtomicU32;

	#[derive(Debug)]
	struct FixedVersion {
		version: u32,
		probes: AtomicU32,
	}

	#[async_trait]
	impl Authority for FixedVersion {
		async fn protocol(&self) -> ClResult<ProtocolInfo> {
			self.probes.fetch_add(1, Ordering::SeqCst);
			Ok(ProtocolInfo { version: self.version })
		}

		async fn stream(&self, _args: StreamArgs) -> ClResult<ChangeBatch> {
			unimplemented!()
		}

		async fn replicate(
			&self,
			_kind: WriteKind,
			_collection: &str,
			_document: &str,
			_bytes: &[u8],
		) -> ClResult<ReplicateAck> {
			unimplemented!()
		}

		async fn recovery(&self, _collection: &str, _vector: &[u8]) -> ClResult<RecoveryDiff> {
			unimplemented!()
		}

		async fn mark(&self, _args: MarkArgs) -> ClResult<()> {
			unimplemented!()
		}

		async fn compact(&self, _collection: &str, _document: &str) -> ClResult<CompactAck> {
			unimplemented!()
		}

		async fn presence(&self, _args: PresenceArgs) -> ClResult<()> {
			unimplemented!()
		}

		async fn session(&self, _args: SessionArgs) -> ClResult<Vec<SessionEntry>> {
			unimplemented!()
		}
	}

	#[tokio::test]
	async fn test_matching_version_is_cached() {
		let fixed = Arc::new(FixedVersion { version: 1, probes: AtomicU32::new(0) });
		let authority: Arc<dyn Authority> = Arc::clone(&fixed) as Arc<dyn Authority>;
		let gate = ProtocolGate::new();

		assert_eq!(gate.verify(&authority).await.expect("verify"), 1);
		assert_eq!(gate.verify(&authority).await.expect("verify"), 1);

		// The second verify came from the cache, not another probe
		assert_eq!(fixed.probes.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_mismatch_inhibits_sync() {
		let authority: Arc<dyn Authority> =
			Arc::new(FixedVersion { version: 9, probes: AtomicU32::new(0) });
		let gate = ProtocolGate::new();

		let err = gate.verify(&authority).await.expect_err("must fail");
		assert!(matches!(err, Error::ProtocolMismatch { server: 9, .. }));
		let err = gate.verify(&authority).await.expect_err("still fails");
		assert!(matches!(err, Error::ProtocolMismatch { .. }));
	}
}

// vim: ts=4
