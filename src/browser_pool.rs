//! Pool of headless Chrome instances shared by the measurement workers.
//!
//! Each instance runs with its own user-data directory and debugging port, so
//! concurrent jobs on different instances share no storage. Sequential jobs
//! reuse instances through leases; per-job isolation on a reused instance is
//! the driver's responsibility, which wipes cookies and per-origin storage
//! before every navigation. A crashed instance is restarted on the next
//! acquisition instead of poisoning the pool.

use chromiumoxide::browser::Browser;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::{create_browser_config, Config};
use crate::error::PumpkinError;

/// One pooled Chrome instance.
#[derive(Debug)]
pub struct BrowserInstance {
    pub id: usize,
    pub browser: Arc<Mutex<Browser>>,
    /// Task polling the CDP message stream; finished means the browser died.
    pub handler: tokio::task::JoinHandle<()>,
    pub created_at: Instant,
    pub page_count: usize,
    pub failure_count: usize,
}

impl BrowserInstance {
    fn new(id: usize, browser: Browser, handler: tokio::task::JoinHandle<()>) -> Self {
        Self {
            id,
            browser: Arc::new(Mutex::new(browser)),
            handler,
            created_at: Instant::now(),
            page_count: 0,
            failure_count: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.handler.is_finished()
    }

    async fn shutdown(self) {
        let _ = self.browser.lock().await.close().await;
        self.handler.abort();
    }
}

/// RAII lease on one pooled browser; returning happens on drop.
pub struct BrowserLease {
    pub browser: Arc<Mutex<Browser>>,
    pub instance_id: usize,
    pool: BrowserPool,
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        let pool = self.pool.clone();
        let instance_id = self.instance_id;
        tokio::spawn(async move {
            pool.return_browser(instance_id).await;
        });
    }
}

#[derive(Clone)]
pub struct BrowserPool {
    instances: Arc<Mutex<Vec<BrowserInstance>>>,
    available: Arc<Mutex<VecDeque<usize>>>,
    semaphore: Arc<Semaphore>,
    config: Config,
    shutting_down: Arc<std::sync::atomic::AtomicBool>,
}

impl BrowserPool {
    /// Launches `size` browser instances up front.
    pub async fn new(config: Config, size: usize) -> Result<Self, PumpkinError> {
        let pool = Self {
            instances: Arc::new(Mutex::new(Vec::new())),
            available: Arc::new(Mutex::new(VecDeque::new())),
            semaphore: Arc::new(Semaphore::new(size)),
            config,
            shutting_down: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };

        {
            let mut instances = pool.instances.lock().await;
            let mut available = pool.available.lock().await;
            for i in 0..size {
                // Stagger launches; concurrent Chrome startups race on the
                // profile lock.
                if i > 0 {
                    sleep(Duration::from_millis(500)).await;
                }
                let instance = pool.launch_instance(i).await?;
                instances.push(instance);
                available.push_back(i);
                info!("browser instance {i} launched");
            }
        }

        Ok(pool)
    }

    async fn launch_instance(&self, id: usize) -> Result<BrowserInstance, PumpkinError> {
        let browser_config = create_browser_config(&self.config, id)?;
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| PumpkinError::DriverError(format!("browser launch: {e}")))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("CDP handler error: {e}");
                    break;
                }
            }
        });

        Ok(BrowserInstance::new(id, browser, handler_task))
    }

    /// Acquires a healthy instance, restarting a dead one when encountered.
    pub async fn get_browser(&self) -> Result<BrowserLease, PumpkinError> {
        if self.shutting_down.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(PumpkinError::DriverError("pool is shutting down".into()));
        }

        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| PumpkinError::DriverError("pool closed".into()))?;
        permit.forget();

        let instance_id = {
            let mut available = self.available.lock().await;
            available
                .pop_front()
                .ok_or_else(|| PumpkinError::DriverError("no browser available".into()))?
        };

        let browser = {
            let mut instances = self.instances.lock().await;
            let instance = instances
                .get_mut(instance_id)
                .ok_or_else(|| PumpkinError::DriverError("instance vanished".into()))?;

            if !instance.is_alive() {
                warn!("browser instance {instance_id} died, restarting");
                let replacement = self.launch_instance(instance_id).await;
                match replacement {
                    Ok(fresh) => {
                        instance.handler.abort();
                        *instance = fresh;
                    }
                    Err(e) => {
                        instance.failure_count += 1;
                        self.available.lock().await.push_back(instance_id);
                        self.semaphore.add_permits(1);
                        return Err(e);
                    }
                }
            }

            instance.page_count += 1;
            instance.browser.clone()
        };

        Ok(BrowserLease {
            browser,
            instance_id,
            pool: self.clone(),
        })
    }

    async fn return_browser(&self, instance_id: usize) {
        self.available.lock().await.push_back(instance_id);
        self.semaphore.add_permits(1);
    }

    pub async fn shutdown(&self) {
        info!("shutting down browser pool");
        self.shutting_down
            .store(true, std::sync::atomic::Ordering::Relaxed);

        // Give leases a moment to drain back.
        for _ in 0..10 {
            let available = self.available.lock().await.len();
            let total = self.instances.lock().await.len();
            if available == total {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }

        let mut instances = self.instances.lock().await;
        for instance in instances.drain(..) {
            instance.shutdown().await;
        }
        info!("browser pool shutdown complete");
    }

    pub async fn stats(&self) -> BrowserPoolStats {
        let instances = self.instances.lock().await;
        let available = self.available.lock().await;
        BrowserPoolStats {
            total_instances: instances.len(),
            available_instances: available.len(),
            alive_instances: instances.iter().filter(|i| i.is_alive()).count(),
            total_pages: instances.iter().map(|i| i.page_count).sum(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrowserPoolStats {
    pub total_instances: usize,
    pub available_instances: usize,
    pub alive_instances: usize,
    pub total_pages: usize,
}
