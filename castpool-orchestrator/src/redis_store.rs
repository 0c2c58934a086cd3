use async_trait::async_trait;
use castpool_common::bus::{
    vm_path, workload_address_path, VmAddress, CHANNEL_POOL_CHANGES, PATH_POOL_CONFIG, PATH_POOL_VMS,
};
use castpool_common::{PoolConfig, VmRecord, VmStatus};
use redis::AsyncCommands;
use tokio::sync::broadcast;

use crate::store::{PoolStore, StoreChange, StoreError};

// Swap only if the stored JSON still carries the expected status.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return 0
end
local decoded = cjson.decode(current)
if decoded['status'] ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

/// Publish a change notification. The write it describes has already landed, so
/// a failed publish is logged and reported as `false`, never raised.
async fn announce_on<C>(conn: &mut C, channel: &str, change: &StoreChange) -> bool
where
    C: redis::aio::ConnectionLike + Send,
{
    let payload = match serde_json::to_string(change) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(?change, error = %e, "failed to encode store change");
            return false;
        }
    };
    match conn.publish::<_, _, ()>(channel, payload).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(?change, error = %e, "store change not announced");
            false
        }
    }
}

/// Logical store path -> Redis key (`pool/vms/vm-1` -> `{prefix}:pool:vms:vm-1`).
fn redis_key(prefix: &str, path: &str) -> String {
    format!("{}:{}", prefix, path.replace('/', ":"))
}

/// Redis-backed store. Values are camelCase JSON; every write is announced on
/// `{prefix}:pool:changes` and the announcement stream feeds `subscribe()`.
pub struct RedisStore {
    conn: redis::aio::MultiplexedConnection,
    prefix: String,
    cas: redis::Script,
    changes: broadcast::Sender<StoreChange>,
}

impl RedisStore {
    pub async fn connect(client: &redis::Client, prefix: &str) -> Result<Self, StoreError> {
        let conn = client.get_multiplexed_async_connection().await?;
        let (changes, _) = broadcast::channel(256);

        // Dedicated PubSub connection
        let channel = format!("{}:{}", prefix, CHANNEL_POOL_CHANGES);
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;
        tracing::info!(%channel, "🎧 listening for pool changes");

        let forward = changes.clone();
        tokio::spawn(async move {
            use futures_util::StreamExt;
            let mut stream = pubsub.on_message();

            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "unreadable pool change payload");
                        continue;
                    }
                };
                match serde_json::from_str::<StoreChange>(&payload) {
                    Ok(change) => {
                        let _ = forward.send(change);
                    }
                    Err(e) => tracing::warn!(error = %e, %payload, "unknown pool change"),
                }
            }
            tracing::warn!("pool change subscription closed");
        });

        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            cas: redis::Script::new(CAS_SCRIPT),
            changes,
        })
    }

    fn config_key(&self) -> String {
        redis_key(&self.prefix, PATH_POOL_CONFIG)
    }

    fn vm_set_key(&self) -> String {
        redis_key(&self.prefix, PATH_POOL_VMS)
    }

    fn vm_key(&self, vm_id: &str) -> String {
        redis_key(&self.prefix, &vm_path(vm_id))
    }

    fn address_key(&self, workload_id: &str) -> String {
        redis_key(&self.prefix, &workload_address_path(workload_id))
    }

    async fn announce(&self, change: StoreChange) -> bool {
        let mut conn = self.conn.clone();
        announce_on(&mut conn, &format!("{}:{}", self.prefix, CHANNEL_POOL_CHANGES), &change).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: String) -> Result<Option<T>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        raw.map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl PoolStore for RedisStore {
    async fn get_config(&self) -> Result<Option<PoolConfig>, StoreError> {
        self.get_json(self.config_key()).await
    }

    async fn put_config(&self, config: &PoolConfig) -> Result<(), StoreError> {
        let json = serde_json::to_string(config)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set(self.config_key(), json).await?;
        self.announce(StoreChange::Config).await;
        Ok(())
    }

    async fn list_vms(&self) -> Result<Vec<VmRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(self.vm_set_key()).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| self.vm_key(id)).collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        let mut vms = Vec::with_capacity(raw.len());
        for (id, value) in ids.iter().zip(raw) {
            match value {
                Some(json) => vms.push(serde_json::from_str::<VmRecord>(&json)?),
                // Set member without a record: a delete raced us.
                None => tracing::debug!(vm_id = %id, "dangling pool member"),
            }
        }
        vms.sort_by(|a, b| a.vm_id.cmp(&b.vm_id));
        Ok(vms)
    }

    async fn get_vm(&self, vm_id: &str) -> Result<Option<VmRecord>, StoreError> {
        self.get_json(self.vm_key(vm_id)).await
    }

    async fn put_vm(&self, vm: &VmRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(vm)?;
        let mut conn = self.conn.clone();
        let (): () = redis::pipe()
            .atomic()
            .set(self.vm_key(&vm.vm_id), json)
            .ignore()
            .sadd(self.vm_set_key(), &vm.vm_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        self.announce(StoreChange::Vm {
            vm_id: vm.vm_id.clone(),
        })
        .await;
        Ok(())
    }

    async fn compare_and_set_vm(&self, vm: &VmRecord, expected: VmStatus) -> Result<bool, StoreError> {
        let json = serde_json::to_string(vm)?;
        let mut conn = self.conn.clone();
        let swapped: i32 = self
            .cas
            .key(self.vm_key(&vm.vm_id))
            .arg(expected.as_str())
            .arg(json)
            .invoke_async(&mut conn)
            .await?;
        if swapped == 0 {
            return Ok(false);
        }
        self.announce(StoreChange::Vm {
            vm_id: vm.vm_id.clone(),
        })
        .await;
        Ok(true)
    }

    async fn delete_vm(&self, vm_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let (): () = redis::pipe()
            .atomic()
            .del(self.vm_key(vm_id))
            .ignore()
            .srem(self.vm_set_key(), vm_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        self.announce(StoreChange::Vm {
            vm_id: vm_id.to_string(),
        })
        .await;
        Ok(())
    }

    async fn get_workload_address(&self, workload_id: &str) -> Result<Option<VmAddress>, StoreError> {
        self.get_json(self.address_key(workload_id)).await
    }

    async fn put_workload_address(&self, workload_id: &str, address: &VmAddress) -> Result<(), StoreError> {
        let json = serde_json::to_string(address)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set(self.address_key(workload_id), json).await?;
        self.announce(StoreChange::WorkloadAddress {
            workload_id: workload_id.to_string(),
        })
        .await;
        Ok(())
    }

    async fn delete_workload_address(&self, workload_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.address_key(workload_id)).await?;
        self.announce(StoreChange::WorkloadAddress {
            workload_id: workload_id.to_string(),
        })
        .await;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_store_paths() {
        assert_eq!(redis_key("castpool", PATH_POOL_CONFIG), "castpool:pool:config");
        assert_eq!(redis_key("castpool", PATH_POOL_VMS), "castpool:pool:vms");
        assert_eq!(redis_key("castpool", &vm_path("vm-1")), "castpool:pool:vms:vm-1");
        assert_eq!(
            redis_key("castpool", &workload_address_path("comp-1")),
            "castpool:workload:comp-1:config:vmAddress"
        );
    }

    struct ClosedConnection;

    impl redis::aio::ConnectionLike for ClosedConnection {
        fn req_packed_command<'a>(&'a mut self, _cmd: &'a redis::Cmd) -> redis::RedisFuture<'a, redis::Value> {
            Box::pin(async { Err(redis::RedisError::from((redis::ErrorKind::IoError, "connection closed"))) })
        }

        fn req_packed_commands<'a>(
            &'a mut self,
            _cmd: &'a redis::Pipeline,
            _offset: usize,
            _count: usize,
        ) -> redis::RedisFuture<'a, Vec<redis::Value>> {
            Box::pin(async { Err(redis::RedisError::from((redis::ErrorKind::IoError, "connection closed"))) })
        }

        fn get_db(&self) -> i64 {
            0
        }
    }

    #[tokio::test]
    async fn failed_announce_is_not_an_error() {
        let change = StoreChange::Vm { vm_id: "vm-1".into() };
        assert!(!announce_on(&mut ClosedConnection, "castpool:pool:changes", &change).await);
    }
}
