//! In-memory connection pool with a fixed number of slots.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use leasewatch::{LeasedResource, ResourcePool};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: u32,
}

impl LeasedResource for Connection {
    type Key = u32;

    fn lease_key(&self) -> u32 {
        self.id
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("timed out after {0:?} waiting for a free connection")]
    Timeout(Duration),
    #[error("pool is closed")]
    Closed,
    #[error("connection {0} returned twice")]
    DoubleReturn(u32),
}

pub struct MemoryPool {
    available: Semaphore,
    idle: Mutex<Vec<u32>>,
    checkout_timeout: Duration,
}

impl MemoryPool {
    pub fn new(size: u32, checkout_timeout: Duration) -> Self {
        Self {
            available: Semaphore::new(size as usize),
            idle: Mutex::new((0..size).rev().collect()),
            checkout_timeout,
        }
    }

    pub fn idle(&self) -> usize {
        self.available.available_permits()
    }

    pub fn close(&self) {
        self.available.close();
    }

    fn idle_list(&self) -> std::sync::MutexGuard<'_, Vec<u32>> {
        match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ResourcePool for MemoryPool {
    type Resource = Connection;
    type Error = PoolError;

    async fn acquire(&self) -> Result<Connection, PoolError> {
        let permit = tokio::time::timeout(self.checkout_timeout, self.available.acquire())
            .await
            .map_err(|_| PoolError::Timeout(self.checkout_timeout))?
            .map_err(|_| PoolError::Closed)?;
        // Returned explicitly through release().
        permit.forget();

        let id = self.idle_list().pop().ok_or(PoolError::Closed)?;
        Ok(Connection { id })
    }

    async fn release(&self, conn: Connection) -> Result<(), PoolError> {
        {
            let mut idle = self.idle_list();
            if idle.contains(&conn.id) {
                return Err(PoolError::DoubleReturn(conn.id));
            }
            idle.push(conn.id);
        }
        self.available.add_permits(1);
        Ok(())
    }
}
