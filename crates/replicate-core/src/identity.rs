//! Identity anchors: stable client id per collection, process-lifetime
//! session id, and the optional user identity getter surfaced to the presence
//! collaborator.

use std::sync::Arc;

use replicate_types::storage_adapter::StorageAdapter;
use replicate_types::types::UserProfile;
use replicate_types::utils::fold_client_id;
use uuid::Uuid;

use crate::prelude::*;

/// Caller-supplied getter for the signed-in user, if any.
pub type UserGetter = Arc<dyn Fn() -> Option<UserProfile> + Send + Sync>;

const SESSION_KEY: &str = "replicate:sessionClientId";

/// Identity anchors for one collection.
#[derive(Clone, Debug)]
pub struct Identity {
	/// Stable 128-bit client id, persisted on first run.
	pub client: ClientId,
	/// CRDT actor id derived from the client id (53-bit fold).
	pub actor_id: u64,
	/// Process-lifetime session id.
	pub session: ClientId,
}

/// Load the collection's client id, generating and persisting one on first
/// run, and stamp a fresh session id for this process.
pub async fn load_or_create(
	storage: &Arc<dyn StorageAdapter>,
	collection: &str,
) -> ClResult<Identity> {
	let key = format!("replicate:clientId:{}", collection);
	let client = match storage.get(&key).await? {
		Some(bytes) => {
			let text = String::from_utf8(bytes).map_err(|_| Error::Parse)?;
			ClientId(text.into_boxed_str())
		}
		None => {
			let id = Uuid::new_v4().to_string();
			storage.set(&key, id.as_bytes()).await?;
			debug!("generated client id {} for {}", id, collection);
			ClientId(id.into_boxed_str())
		}
	};

	let session = ClientId(Uuid::new_v4().to_string().into_boxed_str());
	// The session id is process-lifetime only; the stored copy exists for
	// host-side diagnostics and is overwritten on every start.
	storage.set(SESSION_KEY, session.as_str().as_bytes()).await?;

	let actor_id = fold_client_id(client.as_str());
	Ok(Identity { client, actor_id, session })
}


// vim: ts=4
