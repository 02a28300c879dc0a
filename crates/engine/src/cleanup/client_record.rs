//! The per-bucket cleanup-client registry.
//!
//! Every process running lost-attempt cleanup heartbeats into a single
//! `_txn:client-record` document per bucket. The surviving set of
//! clients, sorted by uuid, partitions the bucket's ATR ids: client `i`
//! of `N` owns every ATR whose index is `i mod N`. Membership is
//! eventually consistent; overlap during churn is harmless because all
//! cleanup actions are idempotent and CAS-guarded.

use crate::config::CLIENT_RECORD_EXPIRES_MS;
use crate::fields;
use keystone_kv::{
    DurabilityLevel, KeyspaceRef, KvError, KvResult, KvStore, LookupOptions, LookupSpec, Macro,
    MutateOptions, MutateSpec, MutateValue, StoreSemantics,
};
use serde_json::{json, Value};
use tracing::{debug, trace};

/// At most this many expired clients are pruned per heartbeat write,
/// bounding the mutation size.
const PRUNE_CAP: usize = 13;

/// This client's view of the registry after one heartbeat.
#[derive(Debug, Clone)]
pub struct ClientRecordDetails {
    /// Our uuid
    pub client_uuid: String,
    /// Surviving clients, ourselves included
    pub num_active_clients: usize,
    /// Our rank in the uuid-sorted surviving set
    pub index_of_this_client: usize,
    /// Clients whose heartbeat lapsed
    pub expired_client_ids: Vec<String>,
    /// Server time of the read, ms
    pub now_ms: u64,
}

impl ClientRecordDetails {
    /// The ATR indexes this client is responsible for.
    pub fn assigned_atr_indexes(&self, num_atrs: u32) -> impl Iterator<Item = u32> + '_ {
        let stride = self.num_active_clients.max(1) as u32;
        let first = self.index_of_this_client as u32;
        (first..num_atrs).step_by(stride as usize)
    }
}

/// Heartbeat into the registry of `keyspace` and compute this client's
/// shard assignment. Creates the record document on first contact.
pub(crate) fn process_client_record(
    kv: &dyn KvStore,
    keyspace: &KeyspaceRef,
    client_uuid: &str,
    durability: DurabilityLevel,
) -> KvResult<ClientRecordDetails> {
    for _ in 0..2 {
        match read_and_heartbeat(kv, keyspace, client_uuid, durability) {
            Err(KvError::DocumentNotFound) => {
                debug!(keyspace = %keyspace, "client record missing, creating");
                create_client_record(kv, keyspace, durability)?;
                continue;
            }
            other => return other,
        }
    }
    Err(KvError::Temporary)
}

fn read_and_heartbeat(
    kv: &dyn KvStore,
    keyspace: &KeyspaceRef,
    client_uuid: &str,
    durability: DurabilityLevel,
) -> KvResult<ClientRecordDetails> {
    let res = kv.lookup_in(
        keyspace,
        fields::CLIENT_RECORD_ID,
        &[
            LookupSpec::get(fields::CLIENT_RECORD_CLIENTS),
            LookupSpec::get("$vbucket.HLC").xattr(),
        ],
        LookupOptions::default(),
    )?;
    let now_ms = res
        .entry(1)
        .and_then(|hlc| hlc.get("now"))
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<u64>().ok())
        .map(|secs| secs * 1000)
        .unwrap_or(0);

    let mut active: Vec<String> = Vec::new();
    let mut expired: Vec<String> = Vec::new();
    if let Some(clients) = res.entry(0).and_then(Value::as_object) {
        for (uuid, record) in clients {
            let heartbeat_ms = record
                .get(fields::CLIENT_RECORD_HEARTBEAT)
                .and_then(Value::as_u64)
                .map(|ns| ns / 1_000_000)
                .unwrap_or(0);
            let expires_ms = record
                .get(fields::CLIENT_RECORD_EXPIRES)
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let lapsed = now_ms > heartbeat_ms && now_ms - heartbeat_ms >= expires_ms;
            trace!(
                client = %uuid,
                heartbeat_ms,
                expires_ms,
                now_ms,
                lapsed,
                "client record entry"
            );
            if lapsed && uuid != client_uuid {
                expired.push(uuid.clone());
            } else {
                active.push(uuid.clone());
            }
        }
    }
    if !active.iter().any(|u| u == client_uuid) {
        active.push(client_uuid.to_string());
    }
    active.sort();
    let index = active
        .iter()
        .position(|u| u == client_uuid)
        .unwrap_or_default();

    let own_prefix = format!("{}.{}", fields::CLIENT_RECORD_CLIENTS, client_uuid);
    let mut specs = vec![
        MutateSpec::upsert(
            format!("{}.{}", own_prefix, fields::CLIENT_RECORD_HEARTBEAT),
            MutateValue::Expand(Macro::Cas),
        )
        .create_path(),
        MutateSpec::upsert(
            format!("{}.{}", own_prefix, fields::CLIENT_RECORD_EXPIRES),
            json!(CLIENT_RECORD_EXPIRES_MS),
        )
        .create_path(),
    ];
    for uuid in expired.iter().take(PRUNE_CAP) {
        specs.push(MutateSpec::remove(format!(
            "{}.{}",
            fields::CLIENT_RECORD_CLIENTS,
            uuid
        )));
    }
    kv.mutate_in(
        keyspace,
        fields::CLIENT_RECORD_ID,
        &specs,
        MutateOptions::default().durability(durability),
    )?;

    let details = ClientRecordDetails {
        client_uuid: client_uuid.to_string(),
        num_active_clients: active.len(),
        index_of_this_client: index,
        expired_client_ids: expired,
        now_ms,
    };
    debug!(
        keyspace = %keyspace,
        active = details.num_active_clients,
        index = details.index_of_this_client,
        pruned = details.expired_client_ids.len().min(PRUNE_CAP),
        "heartbeat recorded"
    );
    Ok(details)
}

fn create_client_record(
    kv: &dyn KvStore,
    keyspace: &KeyspaceRef,
    durability: DurabilityLevel,
) -> KvResult<()> {
    match kv.mutate_in(
        keyspace,
        fields::CLIENT_RECORD_ID,
        &[MutateSpec::insert(fields::CLIENT_RECORD_CLIENTS, json!({}))],
        MutateOptions::default()
            .store_semantics(StoreSemantics::Insert)
            .durability(durability),
    ) {
        Ok(_) => Ok(()),
        // Someone else created it first
        Err(KvError::DocumentExists) | Err(KvError::PathExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove this client's registry entry on shutdown.
pub(crate) fn remove_client_record(
    kv: &dyn KvStore,
    keyspace: &KeyspaceRef,
    client_uuid: &str,
    durability: DurabilityLevel,
) -> KvResult<()> {
    let path = format!("{}.{}", fields::CLIENT_RECORD_CLIENTS, client_uuid);
    match kv.mutate_in(
        keyspace,
        fields::CLIENT_RECORD_ID,
        &[
            MutateSpec::upsert(path.clone(), Value::Null),
            MutateSpec::remove(path),
        ],
        MutateOptions::default().durability(durability),
    ) {
        Ok(_) => Ok(()),
        Err(KvError::DocumentNotFound) | Err(KvError::PathNotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_kv::mem::MemCluster;

    fn ks() -> KeyspaceRef {
        KeyspaceRef::default_collection("b")
    }

    #[test]
    fn test_first_client_creates_record() {
        let kv = MemCluster::new();
        let details = process_client_record(&kv, &ks(), "client-a", DurabilityLevel::None).unwrap();
        assert_eq!(details.num_active_clients, 1);
        assert_eq!(details.index_of_this_client, 0);
        assert!(details.expired_client_ids.is_empty());
    }

    #[test]
    fn test_two_clients_partition_by_uuid_order() {
        let kv = MemCluster::new();
        process_client_record(&kv, &ks(), "client-b", DurabilityLevel::None).unwrap();
        let a = process_client_record(&kv, &ks(), "client-a", DurabilityLevel::None).unwrap();
        let b = process_client_record(&kv, &ks(), "client-b", DurabilityLevel::None).unwrap();
        assert_eq!(a.num_active_clients, 2);
        assert_eq!(b.num_active_clients, 2);
        // Sorted by uuid: "client-a" < "client-b"
        assert_eq!(a.index_of_this_client, 0);
        assert_eq!(b.index_of_this_client, 1);

        let a_set: Vec<u32> = a.assigned_atr_indexes(8).collect();
        let b_set: Vec<u32> = b.assigned_atr_indexes(8).collect();
        assert_eq!(a_set, vec![0, 2, 4, 6]);
        assert_eq!(b_set, vec![1, 3, 5, 7]);
    }

    #[test]
    fn test_shard_cover_is_complete_and_disjoint() {
        let clients = ["u1", "u2", "u3"];
        let kv = MemCluster::new();
        let mut seen = vec![0u8; 1024];
        for c in clients {
            let d = process_client_record(&kv, &ks(), c, DurabilityLevel::None).unwrap();
            // All three have heartbeated by the last iteration; re-run
            // to get the final assignment
            let _ = d;
        }
        for c in clients {
            let d = process_client_record(&kv, &ks(), c, DurabilityLevel::None).unwrap();
            assert_eq!(d.num_active_clients, 3);
            for idx in d.assigned_atr_indexes(1024) {
                seen[idx as usize] += 1;
            }
        }
        assert!(seen.iter().all(|&n| n == 1));
    }

    #[test]
    fn test_remove_client_record() {
        let kv = MemCluster::new();
        process_client_record(&kv, &ks(), "client-a", DurabilityLevel::None).unwrap();
        process_client_record(&kv, &ks(), "client-b", DurabilityLevel::None).unwrap();
        remove_client_record(&kv, &ks(), "client-a", DurabilityLevel::None).unwrap();
        let b = process_client_record(&kv, &ks(), "client-b", DurabilityLevel::None).unwrap();
        assert_eq!(b.num_active_clients, 1);
        assert_eq!(b.index_of_this_client, 0);
        // Removing an absent client is fine
        remove_client_record(&kv, &ks(), "client-zz", DurabilityLevel::None).unwrap();
    }
}
