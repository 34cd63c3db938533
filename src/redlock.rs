use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use futures::Future;
use once_cell::sync::Lazy;
use rand::{thread_rng, Rng, RngCore};
use redis::Value::Okay;
use redis::{Client, IntoConnectionInfo, RedisResult, Script, Value};
use tracing::debug;

use crate::error::LockError;
use crate::lock::{LockClient, LockHandle};

const DEFAULT_RETRY_COUNT: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);
const CLOCK_DRIFT_FACTOR: f32 = 0.01;

static UNLOCK_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
else
  return 0
end
"#,
    )
});
static EXTEND_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call("get", KEYS[1]) ~= ARGV[1] then
  return 0
else
  if redis.call("set", KEYS[1], ARGV[1], "PX", ARGV[2]) ~= nil then
    return 1
  else
    return 0
  end
end
"#,
    )
});

/// The shared quorum machinery behind the client and its handles.
#[derive(Debug, Clone)]
struct Redlock {
    servers: Arc<Vec<Client>>,
    quorum: u32,
    retry_count: u32,
    retry_delay: Duration,
}

/// Redis-backed [`LockClient`].
///
/// Holds one connection handle per Redis instance and considers an operation
/// successful once a majority of instances agree, with the remaining lock
/// validity reduced by a clock drift allowance.
#[derive(Debug, Clone)]
pub struct RedlockClient {
    inner: Redlock,
}

/// A lock held through [`RedlockClient`].
///
/// Owns the resource name and the random lock value, so it stays usable
/// after the borrow of the client ends.
#[derive(Debug, Clone)]
pub struct RedlockHandle {
    inner: Redlock,
    resource: Vec<u8>,
    val: Vec<u8>,
    /// Milliseconds the lock was still valid for at acquisition time.
    /// Slightly smaller than the requested ttl.
    pub validity_time: usize,
}

/// 20 random bytes, the value guarding compare-and-delete on release.
fn unique_lock_id() -> Vec<u8> {
    let mut buf = [0u8; 20];
    thread_rng().fill_bytes(&mut buf);
    buf.to_vec()
}

impl RedlockClient {
    /// Create a client for the given Redis connection uris.
    /// Quorum is defined to be N/2+1, with N being the number of given
    /// Redis instances.
    ///
    /// Sample URI: `"redis://127.0.0.1:6379"`
    pub fn new<T: IntoConnectionInfo>(uris: Vec<T>) -> RedlockClient {
        let quorum = (uris.len() as u32) / 2 + 1;

        let servers: Vec<Client> = uris
            .into_iter()
            .map(|uri| Client::open(uri).unwrap())
            .collect();

        RedlockClient {
            inner: Redlock {
                servers: Arc::new(servers),
                quorum,
                retry_count: DEFAULT_RETRY_COUNT,
                retry_delay: DEFAULT_RETRY_DELAY,
            },
        }
    }

    /// Set acquisition retry count and retry delay.
    ///
    /// Retry count defaults to `3`.
    /// Retry delay defaults to `200` milliseconds.
    pub fn set_retry(&mut self, count: u32, delay: Duration) {
        self.inner.retry_count = count;
        self.inner.retry_delay = delay;
    }
}

impl Redlock {
    async fn lock_instance(client: &Client, resource: &[u8], val: &[u8], ttl_ms: usize) -> bool {
        let mut con = match client.get_async_connection().await {
            Err(_) => return false,
            Ok(con) => con,
        };
        let result: RedisResult<Value> = redis::cmd("SET")
            .arg(resource)
            .arg(val)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut con)
            .await;

        match result {
            Ok(Okay) => true,
            Ok(_) | Err(_) => false,
        }
    }

    async fn extend_instance(client: &Client, resource: &[u8], val: &[u8], ttl_ms: usize) -> bool {
        let mut con = match client.get_async_connection().await {
            Err(_) => return false,
            Ok(con) => con,
        };
        let result: RedisResult<i32> = EXTEND_SCRIPT
            .key(resource)
            .arg(val)
            .arg(ttl_ms)
            .invoke_async(&mut con)
            .await;
        match result {
            Ok(val) => val == 1,
            Err(_) => false,
        }
    }

    async fn unlock_instance(client: &Client, resource: &[u8], val: &[u8]) -> bool {
        let mut con = match client.get_async_connection().await {
            Err(_) => return false,
            Ok(con) => con,
        };
        let result: RedisResult<i32> = UNLOCK_SCRIPT
            .key(resource)
            .arg(val)
            .invoke_async(&mut con)
            .await;
        match result {
            Ok(val) => val == 1,
            Err(_) => false,
        }
    }

    /// Run `op` against every instance until a quorum agrees, retrying with
    /// jitter. Returns the remaining validity time in milliseconds.
    ///
    /// `unlock_on_miss` cleans partially written keys up after a failed
    /// round; it is wanted when acquiring but not when extending, where a
    /// failed round must not tear down a lock the caller still holds.
    async fn exec_or_retry<'a, F, Fut>(
        &'a self,
        resource: &[u8],
        val: &[u8],
        ttl_ms: usize,
        unlock_on_miss: bool,
        op: F,
    ) -> Result<usize, LockError>
    where
        F: Fn(&'a Client) -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..self.retry_count {
            let start_time = Instant::now();
            let n = join_all(self.servers.iter().map(&op))
                .await
                .into_iter()
                .filter(|locked| *locked)
                .count() as u32;

            let drift = (ttl_ms as f32 * CLOCK_DRIFT_FACTOR) as usize + 2;
            let elapsed = start_time.elapsed();
            let elapsed_ms =
                elapsed.as_secs() as usize * 1000 + elapsed.subsec_nanos() as usize / 1_000_000;
            if ttl_ms <= drift + elapsed_ms {
                return Err(LockError::TtlExceeded);
            }
            let validity_time = ttl_ms - drift - elapsed_ms;

            if n >= self.quorum {
                return Ok(validity_time);
            }
            if unlock_on_miss {
                join_all(
                    self.servers
                        .iter()
                        .map(|client| Self::unlock_instance(client, resource, val)),
                )
                .await;
            }

            let retry_delay: u64 = self
                .retry_delay
                .as_millis()
                .try_into()
                .map_err(|_| LockError::TtlTooLarge)?;
            let jitter = thread_rng().gen_range(0..retry_delay);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }

        Err(LockError::Unavailable {
            attempts: Some(self.retry_count),
        })
    }
}

#[async_trait]
impl LockClient for RedlockClient {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Box<dyn LockHandle>, LockError> {
        let ttl_ms: usize = ttl
            .as_millis()
            .try_into()
            .map_err(|_| LockError::TtlTooLarge)?;
        let resource = key.as_bytes().to_vec();
        let val = unique_lock_id();

        let validity_time = self
            .inner
            .exec_or_retry(&resource, &val, ttl_ms, true, |client| {
                Redlock::lock_instance(client, &resource, &val, ttl_ms)
            })
            .await?;

        debug!(key, ttl_ms, validity_time, "lock acquired");
        Ok(Box::new(RedlockHandle {
            inner: self.inner.clone(),
            resource,
            val,
            validity_time,
        }))
    }
}

#[async_trait]
impl LockHandle for RedlockHandle {
    async fn extend(&self, ttl: Duration) -> Result<(), LockError> {
        let ttl_ms: usize = ttl
            .as_millis()
            .try_into()
            .map_err(|_| LockError::TtlTooLarge)?;

        self.inner
            .exec_or_retry(&self.resource, &self.val, ttl_ms, false, |client| {
                Redlock::extend_instance(client, &self.resource, &self.val, ttl_ms)
            })
            .await?;

        debug!(key = %String::from_utf8_lossy(&self.resource), ttl_ms, "lock extended");
        Ok(())
    }

    async fn release(&self) -> Result<(), LockError> {
        let n = join_all(
            self.inner
                .servers
                .iter()
                .map(|client| Redlock::unlock_instance(client, &self.resource, &self.val)),
        )
        .await
        .into_iter()
        .filter(|unlocked| *unlocked)
        .count() as u32;

        debug!(
            key = %String::from_utf8_lossy(&self.resource),
            confirmed = n,
            "lock released"
        );
        if n >= self.inner.quorum {
            Ok(())
        } else {
            Err(LockError::Unavailable { attempts: None })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_normal<T: Sized + Send + Sync + Unpin>() {}

    #[test]
    fn test_is_normal() {
        is_normal::<RedlockClient>();
        is_normal::<RedlockHandle>();
        is_normal::<LockError>();
    }

    #[test]
    fn test_unique_id_length() {
        assert_eq!(unique_lock_id().len(), 20);
    }

    #[test]
    fn test_unique_id_uniqueness() {
        let id1 = unique_lock_id();
        let id2 = unique_lock_id();

        assert_eq!(20, id1.len());
        assert_eq!(20, id2.len());
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_quorum_is_a_majority() {
        let client = RedlockClient::new(vec![
            "redis://127.0.0.1:6379",
            "redis://127.0.0.1:6380",
            "redis://127.0.0.1:6381",
        ]);

        assert_eq!(3, client.inner.servers.len());
        assert_eq!(2, client.inner.quorum);
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use anyhow::Result;
    use testcontainers::core::{IntoContainerPort, WaitFor};
    use testcontainers::runners::AsyncRunner;
    use testcontainers::{ContainerAsync, GenericImage};

    use super::*;
    use crate::runner::{RunOptions, Runner, RunnerConfig};

    async fn start_nodes() -> Result<(Vec<ContainerAsync<GenericImage>>, Vec<String>)> {
        let mut containers = Vec::new();
        let mut addresses = Vec::new();
        for _ in 0..3 {
            let container = GenericImage::new("redis", "7-alpine")
                .with_exposed_port(6379.tcp())
                .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
                .start()
                .await?;
            let port = container.get_host_port_ipv4(6379).await?;
            addresses.push(format!("redis://127.0.0.1:{port}"));
            containers.push(container);
        }
        Ok((containers, addresses))
    }

    #[tokio::test]
    async fn test_acquire_blocks_a_second_client_until_release() -> Result<()> {
        let (_containers, addresses) = start_nodes().await?;

        let client1 = RedlockClient::new(addresses.clone());
        let client2 = RedlockClient::new(addresses.clone());

        let handle = client1.acquire("resource", Duration::from_millis(1000)).await?;
        assert!(client2
            .acquire("resource", Duration::from_millis(1000))
            .await
            .is_err());

        handle.release().await?;
        let handle2 = client2.acquire("resource", Duration::from_millis(1000)).await?;
        handle2.release().await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_extend_keeps_the_lock_held() -> Result<()> {
        let (_containers, addresses) = start_nodes().await?;

        let client1 = RedlockClient::new(addresses.clone());
        let client2 = RedlockClient::new(addresses.clone());

        let handle = client1.acquire("resource", Duration::from_millis(1000)).await?;

        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.extend(Duration::from_millis(1000)).await?;
        tokio::time::sleep(Duration::from_millis(700)).await;

        // Without the extension the ttl would have lapsed by now.
        assert!(client2
            .acquire("resource", Duration::from_millis(1000))
            .await
            .is_err());

        handle.release().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_runner_outlives_the_initial_ttl() -> Result<()> {
        let (_containers, addresses) = start_nodes().await?;

        let client = RedlockClient::new(addresses.clone());
        let runner = Runner::new(client, RunnerConfig::default());

        let value = runner
            .run(
                || async {
                    tokio::time::sleep(Duration::from_millis(800)).await;
                    Ok::<_, anyhow::Error>("survived")
                },
                RunOptions::new("resource").lock_ttl(Duration::from_millis(300)),
            )
            .await
            .expect("task should outlive its initial ttl through extension");

        assert_eq!(value, "survived");
        Ok(())
    }
}
