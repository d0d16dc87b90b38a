//! Next-hop resolution.
//!
//! [`RouteResolver::resolve`] fills in a route's source address, local MAC,
//! queue and next-hop MAC. Everything that can be answered from the OS
//! tables happens inline; neighbor solicitation, which means network I/O, is
//! handed to a dedicated worker thread so the caller is never blocked.
//!
//! ```text
//!  resolve ─▶ best_route ─▶ interface + queue ─▶ neighbor cache
//!                                                   │ hit   │ miss
//!                                         callback ◀┘       ▼
//!                                                    worker channel
//!                                                           │
//!                                        resolve_neighbor ◀─┘ ─▶ callback
//! ```
//!
//! Every call ends in exactly one callback: inline, from the worker, or with
//! a failure when the resolver shuts down first.

use crate::backend::QueueId;
use crate::frame::MacAddress;
use crate::netstack::NetworkStack;
use crate::route::{Route, RouteState};
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

/// Outcome delivered to a resolution callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteCompletion {
    /// Path id passed to [`RouteResolver::resolve`]
    pub path_id: u8,
    /// Next-hop MAC on success, `None` on failure
    pub next_hop: Option<MacAddress>,
}

impl RouteCompletion {
    /// Whether resolution succeeded.
    pub fn is_success(&self) -> bool {
        self.next_hop.is_some()
    }
}

/// Callback invoked once per resolution request.
pub type RouteCallback = Box<dyn FnOnce(RouteCompletion) + Send + 'static>;

/// Immediate result of [`RouteResolver::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStatus {
    /// Resolved inline; the callback has already run
    Completed,
    /// Queued on the worker; the callback runs later
    Pending,
    /// Failed inline; the callback has already run
    Failed,
}

/// Round-robin queue assignment per interface.
#[derive(Debug, Default)]
pub struct QueueAssigner {
    interfaces: HashMap<u32, (Vec<QueueId>, AtomicUsize)>,
}

impl QueueAssigner {
    /// Build from `(interface_index, queue)` pairs.
    pub fn new(queues: impl IntoIterator<Item = (u32, QueueId)>) -> Self {
        let mut interfaces: HashMap<u32, (Vec<QueueId>, AtomicUsize)> = HashMap::new();
        for (interface_index, queue) in queues {
            interfaces
                .entry(interface_index)
                .or_insert_with(|| (Vec::new(), AtomicUsize::new(0)))
                .0
                .push(queue);
        }
        Self { interfaces }
    }

    /// Next queue on `interface_index`, if the datapath owns any there.
    pub fn assign(&self, interface_index: u32) -> Option<QueueId> {
        let (queues, next) = self.interfaces.get(&interface_index)?;
        if queues.is_empty() {
            return None;
        }
        let i = next.fetch_add(1, Ordering::Relaxed) % queues.len();
        Some(queues[i])
    }
}

/// Holds a callback until it is completed; fails it if dropped unfinished.
struct PendingResolution {
    path_id: u8,
    callback: Option<RouteCallback>,
}

impl PendingResolution {
    fn new(path_id: u8, callback: RouteCallback) -> Self {
        Self {
            path_id,
            callback: Some(callback),
        }
    }

    fn complete(mut self, next_hop: Option<MacAddress>) {
        if let Some(callback) = self.callback.take() {
            callback(RouteCompletion {
                path_id: self.path_id,
                next_hop,
            });
        }
    }
}

impl Drop for PendingResolution {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(RouteCompletion {
                path_id: self.path_id,
                next_hop: None,
            });
        }
    }
}

struct ResolutionOperation {
    target: IpAddr,
    interface_index: u32,
    pending: PendingResolution,
}

enum WorkerMessage {
    Resolve(ResolutionOperation),
    Shutdown,
}

/// Route resolution state machine plus its worker thread.
pub struct RouteResolver {
    stack: Arc<dyn NetworkStack>,
    assigner: QueueAssigner,
    interfaces: HashMap<u32, MacAddress>,
    enabled: Mutex<bool>,
    sender: Sender<WorkerMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RouteResolver {
    /// Start a resolver over `stack`.
    ///
    /// `interfaces` maps interface indices to their MAC; `assigner` decides
    /// which queue a resolved route sends on.
    pub fn new(
        stack: Arc<dyn NetworkStack>,
        interfaces: HashMap<u32, MacAddress>,
        assigner: QueueAssigner,
    ) -> std::io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let worker_stack = Arc::clone(&stack);
        let worker = thread::Builder::new()
            .name("rawpath-route-resolver".to_string())
            .spawn(move || run_worker(worker_stack, receiver))?;
        Ok(Self {
            stack,
            assigner,
            interfaces,
            enabled: Mutex::new(true),
            sender,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Resolve `route`, reporting the outcome through `callback`.
    ///
    /// On [`ResolveStatus::Completed`] the route is already updated. On
    /// [`ResolveStatus::Pending`] the caller applies the completion with
    /// [`Route::complete_resolution`]. The remote address must be specified.
    pub fn resolve(&self, route: &mut Route, path_id: u8, callback: RouteCallback) -> ResolveStatus {
        let pending = PendingResolution::new(path_id, callback);
        let previous = route.state;
        route.state = RouteState::Resolving;

        match self.lookup(route, previous) {
            Ok(Lookup::Cached(mac)) => {
                route.next_hop_link_layer_address = mac;
                route.state = RouteState::Resolved;
                tracing::debug!(path_id, next_hop = %mac, "Route resolved from neighbor cache");
                pending.complete(Some(mac));
                ResolveStatus::Completed
            }
            Ok(Lookup::Solicit {
                target,
                interface_index,
            }) => {
                let enabled = self.enabled.lock().unwrap_or_else(PoisonError::into_inner);
                if !*enabled {
                    drop(enabled);
                    route.state = RouteState::Unresolved;
                    pending.complete(None);
                    return ResolveStatus::Failed;
                }
                let operation = ResolutionOperation {
                    target,
                    interface_index,
                    pending,
                };
                if self.sender.send(WorkerMessage::Resolve(operation)).is_err() {
                    // Worker gone; the returned operation drops and fails.
                    route.state = RouteState::Unresolved;
                    return ResolveStatus::Failed;
                }
                tracing::debug!(path_id, %target, "Route resolution queued");
                ResolveStatus::Pending
            }
            Err(reason) => {
                tracing::debug!(path_id, remote = %route.remote_address, reason, "Route resolution failed");
                route.state = RouteState::Unresolved;
                pending.complete(None);
                ResolveStatus::Failed
            }
        }
    }

    /// Resolve `route` and wait for the outcome.
    ///
    /// The route is updated with the result before returning.
    pub async fn resolve_async(&self, route: &mut Route, path_id: u8) -> RouteCompletion {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.resolve(
            route,
            path_id,
            Box::new(move |completion| {
                let _ = tx.send(completion);
            }),
        );
        let completion = rx.await.unwrap_or(RouteCompletion {
            path_id,
            next_hop: None,
        });
        route.complete_resolution(completion.next_hop);
        completion
    }

    fn lookup(&self, route: &mut Route, previous: RouteState) -> Result<Lookup, &'static str> {
        let remote = route.remote_address.ip().to_canonical();
        if remote.is_unspecified() {
            return Err("remote address unspecified");
        }
        let hint = Some(route.local_address.ip().to_canonical()).filter(|ip| !ip.is_unspecified());

        let best = self
            .stack
            .best_route(remote, hint)
            .map_err(|_| "no route to remote")?;

        let local_ip = best.local_ip.to_canonical();
        if previous == RouteState::Suspect && local_ip != route.local_address.ip().to_canonical() {
            return Err("local address changed on suspect route");
        }
        route.local_address.set_ip(local_ip);

        let mac = self
            .interfaces
            .get(&best.interface_index)
            .copied()
            .ok_or("no matching interface")?;
        route.local_link_layer_address = mac;
        route.queue = Some(
            self.assigner
                .assign(best.interface_index)
                .ok_or("no queue on interface")?,
        );

        let target = if best.next_hop.is_unspecified() {
            remote
        } else {
            best.next_hop.to_canonical()
        };

        let entry = self
            .stack
            .neighbor(target, best.interface_index)
            .ok()
            .flatten();
        match entry {
            Some(entry)
                if entry.state.is_usable()
                    && !(previous == RouteState::Suspect
                        && entry.mac == route.next_hop_link_layer_address) =>
            {
                Ok(Lookup::Cached(entry.mac))
            }
            _ => Ok(Lookup::Solicit {
                target,
                interface_index: best.interface_index,
            }),
        }
    }

    /// Stop the worker. Queued and future requests fail.
    pub fn shutdown(&self) {
        {
            let mut enabled = self.enabled.lock().unwrap_or_else(PoisonError::into_inner);
            if !*enabled {
                return;
            }
            *enabled = false;
            let _ = self.sender.send(WorkerMessage::Shutdown);
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("Route resolver worker panicked");
            }
        }
        tracing::debug!("Route resolver stopped");
    }
}

impl Drop for RouteResolver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for RouteResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteResolver")
            .field("interfaces", &self.interfaces.len())
            .finish_non_exhaustive()
    }
}

enum Lookup {
    Cached(MacAddress),
    Solicit { target: IpAddr, interface_index: u32 },
}

fn run_worker(stack: Arc<dyn NetworkStack>, receiver: Receiver<WorkerMessage>) {
    tracing::debug!("Route resolver worker started");
    while let Ok(first) = receiver.recv() {
        let mut batch = vec![first];
        batch.extend(receiver.try_iter());
        let shutdown = batch
            .iter()
            .any(|message| matches!(message, WorkerMessage::Shutdown));

        for message in batch {
            let WorkerMessage::Resolve(operation) = message else {
                continue;
            };
            if shutdown {
                operation.pending.complete(None);
                continue;
            }
            match stack.resolve_neighbor(operation.target, operation.interface_index) {
                Ok(mac) => {
                    tracing::debug!(target = %operation.target, %mac, "Neighbor resolved");
                    operation.pending.complete(Some(mac));
                }
                Err(e) => {
                    tracing::debug!(target = %operation.target, error = %e, "Neighbor resolution failed");
                    operation.pending.complete(None);
                }
            }
        }

        if shutdown {
            break;
        }
    }
    tracing::debug!("Route resolver worker exiting");
}
