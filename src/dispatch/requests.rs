use glam::{DVec3, Vec3};
use log::{debug, trace};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::commands::{CommandKind, Hit, MessageLevel, RequestId};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestKind {
    CameraPosition,
    GroundClamp,
    Intersect,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    CameraPosition { position: DVec3, hpr: Vec3 },
    GroundClamp { position: DVec3, normal: Vec3 },
    Intersect { hits: Vec<Hit> },
}

impl RequestOutcome {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestOutcome::CameraPosition { .. } => RequestKind::CameraPosition,
            RequestOutcome::GroundClamp { .. } => RequestKind::GroundClamp,
            RequestOutcome::Intersect { .. } => RequestKind::Intersect,
        }
    }

    fn from_response(kind: &CommandKind) -> Option<Self> {
        match kind {
            CommandKind::CameraPositionResponse { position, hpr, .. } => Some(RequestOutcome::CameraPosition {
                position: *position,
                hpr: *hpr,
            }),
            CommandKind::GroundClampPositionResponse { position, normal, .. } => Some(RequestOutcome::GroundClamp {
                position: *position,
                normal: *normal,
            }),
            CommandKind::IntersectResponse { hits, .. } => Some(RequestOutcome::Intersect { hits: hits.clone() }),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("the request timed out after {0:?}")]
    TimedOut(Duration),
    #[error("the scene manager stopped before the request was answered")]
    ManagerStopped,
    #[error("the scene manager reported {level:?}: {message}")]
    Producer { level: MessageLevel, message: String },
    #[error("expected a {expected:?} response")]
    UnexpectedResponse { expected: RequestKind },
}

pub type RequestResult = Result<RequestOutcome, RequestError>;

/// Called exactly once with the outcome of a request.
pub type Continuation = Box<dyn FnOnce(RequestResult) + Send>;

struct PendingRequest {
    kind: RequestKind,
    issued: Instant,
    deadline: Instant,
    on_done: Continuation,
}

/// Outstanding requests by correlation id. Every entry leaves the table exactly once: answered,
/// failed or expired.
pub struct PendingRequests {
    next_id: u64,
    pending: BTreeMap<RequestId, PendingRequest>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self {
            next_id: 1,
            pending: BTreeMap::new(),
        }
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next correlation id and starts waiting for it.
    pub fn insert(&mut self, kind: RequestKind, timeout: Duration, on_done: Continuation) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id += 1;

        let issued = Instant::now();
        self.pending.insert(
            id,
            PendingRequest {
                kind,
                issued,
                deadline: issued + timeout,
                on_done,
            },
        );
        id
    }

    /// Resolves the request a response refers to. Late or unknown responses are ignored.
    pub fn resolve(&mut self, response: &CommandKind) -> bool {
        let Some(ref_id) = response.ref_id() else {
            return false;
        };
        let Some(outcome) = RequestOutcome::from_response(response) else {
            return false;
        };
        let Some(request) = self.pending.remove(&ref_id) else {
            debug!("Ignoring {} for {}, nobody is waiting for it", response.name(), ref_id);
            return false;
        };

        trace!("{} answered after {:?}", ref_id, request.issued.elapsed());
        if outcome.kind() == request.kind {
            (request.on_done)(Ok(outcome));
        } else {
            (request.on_done)(Err(RequestError::UnexpectedResponse {
                expected: request.kind,
            }));
        }
        true
    }

    pub fn fail(&mut self, id: RequestId, error: RequestError) -> bool {
        match self.pending.remove(&id) {
            Some(request) => {
                (request.on_done)(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fails every request whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired = self
            .pending
            .iter()
            .filter(|(_, request)| request.deadline <= now)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for id in &expired {
            if let Some(request) = self.pending.remove(id) {
                let waited = request.deadline - request.issued;
                debug!("{} timed out after {:?}", id, waited);
                (request.on_done)(Err(RequestError::TimedOut(waited)));
            }
        }
        expired.len()
    }

    pub fn fail_all(&mut self, error: RequestError) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        for (_, request) in pending {
            (request.on_done)(Err(error.clone()));
        }
        count
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|request| request.deadline).min()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<RequestResult>>>, impl Fn() -> Continuation) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let make = move || -> Continuation {
            let sink = sink.clone();
            Box::new(move |result| sink.lock().unwrap().push(result))
        };
        (results, make)
    }

    fn camera_response(ref_id: RequestId) -> CommandKind {
        CommandKind::CameraPositionResponse {
            ref_id,
            position: DVec3::ONE,
            hpr: Vec3::ZERO,
        }
    }

    #[test]
    fn ids_strictly_increase() {
        let (_, make) = recorder();
        let mut requests = PendingRequests::new();
        let a = requests.insert(RequestKind::CameraPosition, Duration::from_secs(1), make());
        let b = requests.insert(RequestKind::GroundClamp, Duration::from_secs(1), make());
        assert!(a < b);
        assert_eq!(requests.len(), 2);
    }

    #[test]
    fn ids_keep_increasing_past_u32() {
        let (_, make) = recorder();
        let mut requests = PendingRequests::new();
        requests.next_id = u64::from(u32::MAX);
        let a = requests.insert(RequestKind::Intersect, Duration::from_secs(1), make());
        let b = requests.insert(RequestKind::Intersect, Duration::from_secs(1), make());
        assert_eq!(a, RequestId(u64::from(u32::MAX)));
        assert!(a < b);
    }

    #[test]
    fn response_resolves_exactly_once() {
        let (results, make) = recorder();
        let mut requests = PendingRequests::new();
        let id = requests.insert(RequestKind::CameraPosition, Duration::from_secs(1), make());

        assert!(requests.resolve(&camera_response(id)));
        // a duplicate or late response is ignored
        assert!(!requests.resolve(&camera_response(id)));
        assert_eq!(requests.expire(Instant::now() + Duration::from_secs(5)), 0);

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Ok(RequestOutcome::CameraPosition { .. })));
    }

    #[test]
    fn deadline_fails_once_and_late_response_is_ignored() {
        let (results, make) = recorder();
        let mut requests = PendingRequests::new();
        let id = requests.insert(RequestKind::GroundClamp, Duration::from_millis(50), make());

        assert_eq!(requests.expire(Instant::now()), 0);
        assert_eq!(requests.expire(Instant::now() + Duration::from_millis(60)), 1);
        assert!(!requests.resolve(&CommandKind::GroundClampPositionResponse {
            ref_id: id,
            position: DVec3::ZERO,
            normal: Vec3::Z,
        }));

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(RequestError::TimedOut(_))));
    }

    #[test]
    fn mismatched_response_fails_the_request() {
        let (results, make) = recorder();
        let mut requests = PendingRequests::new();
        let id = requests.insert(RequestKind::Intersect, Duration::from_secs(1), make());
        assert!(requests.resolve(&camera_response(id)));
        assert_eq!(
            results.lock().unwrap()[0],
            Err(RequestError::UnexpectedResponse {
                expected: RequestKind::Intersect
            })
        );
    }

    #[test]
    fn fail_all_fires_every_continuation() {
        let (results, make) = recorder();
        let mut requests = PendingRequests::new();
        for _ in 0..3 {
            requests.insert(RequestKind::Intersect, Duration::from_secs(1), make());
        }
        assert!(requests.next_deadline().is_some());
        assert_eq!(requests.fail_all(RequestError::ManagerStopped), 3);
        assert!(requests.is_empty());
        assert!(requests.next_deadline().is_none());
        assert!(
            results
                .lock()
                .unwrap()
                .iter()
                .all(|result| *result == Err(RequestError::ManagerStopped))
        );
    }
}
