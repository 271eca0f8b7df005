//! Watch dispatch
//!
//! Turns store change notifications into work-queue input. Application
//! changes map to their own key; Base changes are resolved to the
//! Applications referencing them by the controller.
//!
//! Only changes that move `metadata.generation` (and deletions) are passed
//! on. Status writes, including the controller's own, never wake a key.

use std::collections::HashMap;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::crd::{Application, Base};
use crate::store::{ObjectKey, StoreEvent};

/// Watcher timeout (seconds); must stay below the client read timeout (30s)
/// so idle watches are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A change relevant to the controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// An Application was created, changed or deleted
    Application(ObjectKey),
    /// A Base was created, changed or deleted
    Base(ObjectKey),
}

impl WatchEvent {
    /// Map an in-memory store notification; other kinds are ignored
    pub fn from_store_event(event: &StoreEvent) -> Option<Self> {
        if event.kind == Application::kind(&()) {
            Some(Self::Application(event.key.clone()))
        } else if event.kind == Base::kind(&()) {
            Some(Self::Base(event.key.clone()))
        } else {
            None
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Application(_) => "Application",
            Self::Base(_) => "Base",
        }
    }
}

/// Drops events for objects whose generation was already seen
#[derive(Debug, Default)]
pub struct GenerationFilter {
    seen: HashMap<(&'static str, ObjectKey), i64>,
}

impl GenerationFilter {
    /// True when the event should reach the controller.
    ///
    /// Deletions and objects without a generation always pass.
    pub fn admit(
        &mut self,
        kind: &'static str,
        key: &ObjectKey,
        generation: Option<i64>,
        deleted: bool,
    ) -> bool {
        let id = (kind, key.clone());
        if deleted {
            self.seen.remove(&id);
            return true;
        }
        match generation {
            Some(generation) => self.seen.insert(id, generation) != Some(generation),
            None => true,
        }
    }
}

fn watched<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn keyed<K>(
    event: Result<Event<K>, watcher::Error>,
    kind: &'static str,
    wrap: fn(ObjectKey) -> WatchEvent,
    filter: &mut GenerationFilter,
) -> Vec<WatchEvent>
where
    K: Resource,
{
    let (obj, deleted) = match event {
        Ok(Event::Apply(obj)) | Ok(Event::InitApply(obj)) => (obj, false),
        Ok(Event::Delete(obj)) => (obj, true),
        Ok(Event::Init) | Ok(Event::InitDone) => {
            debug!(kind, "watch (re)listed");
            return vec![];
        }
        Err(e) => {
            warn!(kind, error = %e, "watch error, will retry");
            return vec![];
        }
    };

    let meta = obj.meta();
    ObjectKey::from_meta(meta)
        .filter(|key| filter.admit(kind, key, meta.generation, deleted))
        .map(wrap)
        .into_iter()
        .collect()
}

/// Events from the API server for Applications and Bases.
///
/// Watches one namespace when `namespace` is set, otherwise all of them.
pub fn kube_events(client: Client, namespace: Option<&str>) -> BoxStream<'static, WatchEvent> {
    let config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);

    let apps = watcher::watcher(
        watched::<Application>(client.clone(), namespace),
        config.clone(),
    )
    .default_backoff()
    .flat_map({
        let mut filter = GenerationFilter::default();
        move |e| stream::iter(keyed(e, "Application", WatchEvent::Application, &mut filter))
    });

    let bases = watcher::watcher(watched::<Base>(client, namespace), config)
        .default_backoff()
        .flat_map({
            let mut filter = GenerationFilter::default();
            move |e| stream::iter(keyed(e, "Base", WatchEvent::Base, &mut filter))
        });

    stream::select(apps, bases).boxed()
}

/// Events from an in-memory store subscription
pub fn store_events(rx: broadcast::Receiver<StoreEvent>) -> BoxStream<'static, WatchEvent> {
    let state = (rx, GenerationFilter::default());
    stream::unfold(state, |(mut rx, mut filter)| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Some(watched) = WatchEvent::from_store_event(&event) else {
                        continue;
                    };
                    if filter.admit(watched.kind(), &event.key, event.generation, event.deleted) {
                        return Some((watched, (rx, filter)));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "store event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
