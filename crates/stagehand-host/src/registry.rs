//! Process-wide table of live kernels, one per (scope, kernel type).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::deployment::DeploymentProvider;
use crate::error::Result;
use crate::jobs::JobQueue;
use crate::kernel::catalog::{self, CATALOG, KernelSpecInfo};
use crate::kernel::Kernel;
use crate::store::UserRef;

struct Entry {
    kernel: Arc<Kernel>,
    /// Generation of the pending detach timer, if any.
    detach: Option<(u64, JoinHandle<()>)>,
}

#[derive(Default)]
struct Table {
    scopes: HashMap<String, HashMap<String, Entry>>,
    next_timer: u64,
}

pub struct KernelRegistry {
    provider: Arc<dyn DeploymentProvider>,
    jobs: Arc<JobQueue>,
    detach_grace: Duration,
    table: Arc<Mutex<Table>>,
}

fn lock(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove the entry if the timer `generation` is still the pending one.
fn take_if_due(
    table: &mut Table,
    scope: &str,
    kernel_type: &str,
    generation: u64,
) -> Option<Arc<Kernel>> {
    let kernels = table.scopes.get_mut(scope)?;
    let due = kernels
        .get(kernel_type)?
        .detach
        .as_ref()
        .is_some_and(|(g, _)| *g == generation);
    if !due {
        return None;
    }
    let entry = kernels.remove(kernel_type)?;
    if kernels.is_empty() {
        table.scopes.remove(scope);
    }
    Some(entry.kernel)
}

impl KernelRegistry {
    pub fn new(
        provider: Arc<dyn DeploymentProvider>,
        jobs: Arc<JobQueue>,
        detach_grace: Duration,
    ) -> Self {
        Self {
            provider,
            jobs,
            detach_grace,
            table: Arc::new(Mutex::new(Table::default())),
        }
    }

    pub fn provider(&self) -> &Arc<dyn DeploymentProvider> {
        &self.provider
    }

    pub fn jobs(&self) -> &Arc<JobQueue> {
        &self.jobs
    }

    /// Kernel of `kernel_type` for `scope`, created on first use. Cancels a
    /// pending detach of that kernel.
    pub fn attach(
        &self,
        kernel_type: &str,
        user: Option<UserRef>,
        scope: &str,
        resource_class: &str,
    ) -> Result<Arc<Kernel>> {
        let spec = catalog::lookup(kernel_type)?;
        let mut table = lock(&self.table);
        let kernels = table.scopes.entry(scope.to_string()).or_default();
        if let Some(entry) = kernels.get_mut(kernel_type) {
            if let Some((_, timer)) = entry.detach.take() {
                timer.abort();
                tracing::debug!(scope, kernel = kernel_type, "detach cancelled by re-attach");
            }
            return Ok(Arc::clone(&entry.kernel));
        }
        let kernel = Arc::new(Kernel::new(
            spec,
            user,
            scope,
            resource_class,
            Arc::clone(&self.provider),
            Arc::clone(&self.jobs),
        ));
        tracing::info!(scope, kernel = kernel_type, kernel_id = %kernel.id(), "kernel registered");
        kernels.insert(
            kernel_type.to_string(),
            Entry {
                kernel: Arc::clone(&kernel),
                detach: None,
            },
        );
        Ok(kernel)
    }

    /// Schedule teardown of the kernel after the grace period. A later
    /// `detach` restarts the timer; an `attach` cancels it.
    pub fn detach(&self, kernel_type: &str, scope: &str) {
        let mut table = lock(&self.table);
        table.next_timer += 1;
        let generation = table.next_timer;
        let Some(entry) = table
            .scopes
            .get_mut(scope)
            .and_then(|kernels| kernels.get_mut(kernel_type))
        else {
            return;
        };
        if let Some((_, timer)) = entry.detach.take() {
            timer.abort();
        }

        let shared = Arc::clone(&self.table);
        let grace = self.detach_grace;
        let scope_key = scope.to_string();
        let type_key = kernel_type.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let removed = take_if_due(&mut lock(&shared), &scope_key, &type_key, generation);
            if let Some(kernel) = removed {
                tracing::info!(scope = %scope_key, kernel = %type_key, kernel_id = %kernel.id(), "detached kernel expired");
                if let Err(err) = kernel.shutdown().await {
                    tracing::warn!(kernel_id = %kernel.id(), error = %err, "shutdown after detach failed");
                }
            }
        });
        entry.detach = Some((generation, timer));
    }

    /// Drop `kernel` from the table right away if it is still the registered
    /// one. Used when creation failed so the next attach starts fresh.
    pub fn evict(&self, kernel_type: &str, scope: &str, kernel: &Arc<Kernel>) -> bool {
        let mut table = lock(&self.table);
        let Some(kernels) = table.scopes.get_mut(scope) else {
            return false;
        };
        let current = kernels
            .get(kernel_type)
            .is_some_and(|entry| Arc::ptr_eq(&entry.kernel, kernel));
        if !current {
            return false;
        }
        if let Some(Entry {
            detach: Some((_, timer)),
            ..
        }) = kernels.remove(kernel_type)
        {
            timer.abort();
        }
        if kernels.is_empty() {
            table.scopes.remove(scope);
        }
        true
    }

    /// Kernel types currently registered for `scope`.
    pub fn attached_types(&self, scope: &str) -> Vec<String> {
        let table = lock(&self.table);
        let mut types: Vec<String> = table
            .scopes
            .get(scope)
            .map(|kernels| kernels.keys().cloned().collect())
            .unwrap_or_default();
        types.sort();
        types
    }

    pub fn get(&self, kernel_type: &str, scope: &str) -> Option<Arc<Kernel>> {
        lock(&self.table)
            .scopes
            .get(scope)
            .and_then(|kernels| kernels.get(kernel_type))
            .map(|entry| Arc::clone(&entry.kernel))
    }

    pub fn is_detaching(&self, kernel_type: &str, scope: &str) -> bool {
        lock(&self.table)
            .scopes
            .get(scope)
            .and_then(|kernels| kernels.get(kernel_type))
            .is_some_and(|entry| entry.detach.is_some())
    }

    pub fn scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = lock(&self.table).scopes.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Catalog of kernel types with display metadata.
    pub fn all(&self) -> Vec<KernelSpecInfo> {
        CATALOG.iter().map(|spec| spec.info()).collect()
    }

    /// Remove every kernel and shut each one down.
    pub async fn shutdown_all(&self) {
        let kernels: Vec<Arc<Kernel>> = {
            let mut table = lock(&self.table);
            table
                .scopes
                .drain()
                .flat_map(|(_, kernels)| kernels.into_values())
                .map(|entry| {
                    if let Some((_, timer)) = entry.detach {
                        timer.abort();
                    }
                    entry.kernel
                })
                .collect()
        };
        for kernel in kernels {
            if let Err(err) = kernel.shutdown().await {
                tracing::warn!(kernel_id = %kernel.id(), error = %err, "kernel shutdown failed");
            }
        }
    }
}
