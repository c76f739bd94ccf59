//! Client session over one or two remote peer groups
//!
//! A session owns at most two peer-group handles: the data-server group
//! (required for a live session) and an optional render-server group.
//! `connect` drives the transport's pending attempts with a cooperative
//! polling loop; `push_state`/`invoke` broadcast fire-and-forget routed
//! messages; `gather_information` runs the synchronous two-phase
//! request/reply exchange with the targeted group's root.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conclave_core::{gather_target, reroute, targets, GatherTarget, Location, ServerUrl};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::info::Information;
use crate::protocol::{
    decode_reply_length, encode_gather_request, encode_message, Opcode, RoutedMessage,
    GATHER_REPLY_TAG, MESSAGE_RMI_TAG,
};
use crate::transport::{PeerGroup, PollStatus, TransportProvider};

/// Bounded wait per connect-loop iteration.
const POLL_SLICE: Duration = Duration::from_secs(1);

/// Liveness value sent on the progress channel while connecting. The
/// fraction carries no meaning beyond "still trying".
const CONNECT_PROGRESS: f64 = 0.5;

/// Handle for cancelling a connect in progress from another task.
#[derive(Clone)]
pub struct ConnectAbort {
    flag: Arc<AtomicBool>,
}

impl ConnectAbort {
    /// Request cancellation; checked once per connect-loop iteration.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

/// In-process handler for messages whose location includes the client.
pub trait LocalDelegate: Send {
    /// Apply a state update locally. Both push and invoke land here; the
    /// local side treats an invoke as a push.
    fn push_state(&mut self, message: &RoutedMessage);

    /// Gather information locally, filling `info`. Returns success.
    fn gather(
        &mut self,
        location: Location,
        info: &mut dyn Information,
        target_object_id: u32,
    ) -> bool;
}

/// A client session routing messages to remote peer groups.
///
/// Call [`Session::close`] before dropping: plain drop releases the
/// handles without notifying the groups.
pub struct Session<T: TransportProvider> {
    id: Uuid,
    transport: T,
    data: Option<Box<dyn PeerGroup>>,
    render: Option<Box<dyn PeerGroup>>,
    abort: Arc<AtomicBool>,
    progress_tx: watch::Sender<f64>,
    local: Option<Box<dyn LocalDelegate>>,
}

impl<T: TransportProvider> Session<T> {
    pub fn new(transport: T) -> Self {
        let (progress_tx, _) = watch::channel(0.0);
        Session {
            id: Uuid::new_v4(),
            transport,
            data: None,
            render: None,
            abort: Arc::new(AtomicBool::new(false)),
            progress_tx,
            local: None,
        }
    }

    /// Install the in-process handler for client-targeted messages.
    pub fn set_local_delegate(&mut self, delegate: Box<dyn LocalDelegate>) {
        self.local = Some(delegate);
    }

    /// Cancellation handle for the connect loop; usable from another task.
    pub fn abort_handle(&self) -> ConnectAbort {
        ConnectAbort {
            flag: self.abort.clone(),
        }
    }

    /// Observe connect liveness notifications.
    pub fn subscribe_progress(&self) -> watch::Receiver<f64> {
        self.progress_tx.subscribe()
    }

    /// True iff the data group is established.
    pub fn is_alive(&self) -> bool {
        self.data.is_some()
    }

    /// Connect to the server(s) named by `url`. Returns `Ok(false)` on an
    /// unrecognized URL (nothing attempted), on abort, and on transport
    /// failure; `Ok(true)` once the data group and, if the URL names one,
    /// the render group are established.
    pub async fn connect(&mut self, url: &str) -> Result<bool> {
        let parsed = match ServerUrl::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(session = %self.id, url = %url, error = %e, "Connect refused");
                return Ok(false);
            }
        };
        info!(
            session = %self.id,
            data = %parsed.data.to_spec_string(),
            render = ?parsed.render.as_ref().map(|r| r.to_spec_string()),
            reverse = parsed.reverse,
            "Connecting"
        );

        self.abort.store(false, Ordering::Relaxed);
        let need_render = parsed.render.is_some();

        let mut data = self.transport.try_connect(&parsed.data).await?;
        let mut render = match &parsed.render {
            Some(spec) => self.transport.try_connect(spec).await?,
            None => None,
        };

        while !self.abort.load(Ordering::Relaxed)
            && (data.is_none() || (need_render && render.is_none()))
        {
            match self.transport.poll(POLL_SLICE).await {
                PollStatus::Activity => {
                    if data.is_none() {
                        data = self.transport.try_connect(&parsed.data).await?;
                    }
                    if render.is_none() {
                        if let Some(spec) = &parsed.render {
                            render = self.transport.try_connect(spec).await?;
                        }
                    }
                }
                PollStatus::Timeout => {
                    debug!(session = %self.id, "Still connecting");
                    let _ = self.progress_tx.send(CONNECT_PROGRESS);
                }
                PollStatus::Error => {
                    error!(session = %self.id, "Transport error while connecting");
                    break;
                }
            }
        }

        // Whatever was established is kept, even on a failed or aborted
        // connect; the caller may close or retry.
        if data.is_some() {
            self.data = data;
        }
        if render.is_some() {
            self.render = render;
        }

        let connected = self.data.is_some() && (!need_render || self.render.is_some());
        if connected {
            info!(session = %self.id, "Session established");
        } else {
            warn!(
                session = %self.id,
                data = self.data.is_some(),
                render = self.render.is_some(),
                aborted = self.abort.load(Ordering::Relaxed),
                "Connect failed"
            );
        }
        Ok(connected)
    }

    /// Broadcast a state update to every destination in the message's
    /// location mask. Fire-and-forget.
    pub async fn push_state(&mut self, message: &RoutedMessage) -> Result<()> {
        self.dispatch(Opcode::Push, message).await
    }

    /// Broadcast an operation to every destination in the message's
    /// location mask. Identical routing to [`Session::push_state`]; only
    /// the opcode differs, and the local side applies it as a push.
    pub async fn invoke(&mut self, message: &RoutedMessage) -> Result<()> {
        self.dispatch(Opcode::Invoke, message).await
    }

    async fn dispatch(&mut self, opcode: Opcode, message: &RoutedMessage) -> Result<()> {
        let location = reroute(message.location, self.render.is_some());
        let targets = targets(location);

        if targets.data {
            let group = self.data.as_mut().ok_or(Error::NotConnected)?;
            let body = encode_message(opcode, &message.payload);
            group.broadcast_to_all(MESSAGE_RMI_TAG, &body).await?;
        }

        // Only reachable when a render group exists; reroute cleared the
        // render bits otherwise.
        if targets.render {
            let group = self.render.as_mut().ok_or(Error::NotConnected)?;
            let body = encode_message(opcode, &message.payload);
            group.broadcast_to_all(MESSAGE_RMI_TAG, &body).await?;
        }

        if targets.client {
            if let Some(local) = &mut self.local {
                local.push_state(message);
            }
        }

        Ok(())
    }

    /// Gather structured information from the groups named by `location`,
    /// filling `info` in place. At most one remote group is queried, the
    /// data group taking priority over the render group when both are
    /// addressed. Protocol failures return `Ok(false)` and leave the
    /// session usable.
    pub async fn gather_information(
        &mut self,
        location: Location,
        info: &mut dyn Information,
        target_object_id: u32,
    ) -> Result<bool> {
        let location = reroute(location, self.render.is_some());

        let mut local_result = false;
        if location.targets_client() {
            if let Some(local) = &mut self.local {
                local_result = local.gather(location, info, target_object_id);
            }
            if info.root_only() {
                return Ok(local_result);
            }
        }

        let Some(target) = gather_target(location, self.render.is_some()) else {
            return Ok(local_result);
        };
        let group = match target {
            GatherTarget::Data => self.data.as_mut(),
            GatherTarget::Render => self.render.as_mut(),
        }
        .ok_or(Error::NotConnected)?;

        let request = encode_gather_request(
            location,
            info.kind(),
            target_object_id,
            &info.serialize_parameters()?,
        );
        // All participants see the request; only the root replies.
        group.broadcast_to_all(MESSAGE_RMI_TAG, &request).await?;

        let length = match group.receive_from_root(GATHER_REPLY_TAG, 4).await {
            Ok(bytes) => decode_reply_length(&bytes)?,
            Err(e) => {
                warn!(session = %self.id, kind = info.kind(), error = %e, "Gather reply lost");
                return Ok(false);
            }
        };
        if length <= 0 {
            warn!(
                session = %self.id,
                kind = info.kind(),
                length,
                "Server failed to gather information"
            );
            return Ok(false);
        }

        let payload = match group
            .receive_from_root(GATHER_REPLY_TAG, length as usize)
            .await
        {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    session = %self.id,
                    kind = info.kind(),
                    error = %e,
                    "Failed to receive information correctly"
                );
                return Ok(false);
            }
        };

        if let Err(e) = info.deserialize_reply(&payload) {
            warn!(session = %self.id, kind = info.kind(), error = %e, "Gather reply unreadable");
            return Ok(false);
        }
        Ok(true)
    }

    /// Tear the session down: each present group is told to close (all
    /// participants) and its handle released. Failure on one group never
    /// prevents closing the other. Safe to call on a closed session.
    ///
    /// Dropping a session without calling `close` releases the
    /// connections but skips the CloseSession broadcast; remote groups
    /// then only learn of the teardown from the transport closing.
    pub async fn close(&mut self) {
        if let Some(mut group) = self.data.take() {
            let body = encode_message(Opcode::CloseSession, &[]);
            if let Err(e) = group.broadcast_to_all(MESSAGE_RMI_TAG, &body).await {
                warn!(session = %self.id, error = %e, "Data group close notification failed");
            }
        }
        if let Some(mut group) = self.render.take() {
            let body = encode_message(Opcode::CloseSession, &[]);
            if let Err(e) = group.broadcast_to_all(MESSAGE_RMI_TAG, &body).await {
                warn!(session = %self.id, error = %e, "Render group close notification failed");
            }
        }
        debug!(session = %self.id, "Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use conclave_core::ConnectionSpec;

    use crate::info::JsonInformation;
    use crate::protocol::{decode_gather_request, decode_message, encode_reply_length};

    type SentLog = Arc<Mutex<Vec<(u32, Vec<u8>)>>>;

    /// Scripted peer group: records broadcasts, pops canned root replies.
    struct FakeGroup {
        sent: SentLog,
        replies: Arc<Mutex<VecDeque<Result<Vec<u8>>>>>,
        receives: Arc<Mutex<usize>>,
    }

    impl FakeGroup {
        fn new() -> (Self, SentLog, Arc<Mutex<VecDeque<Result<Vec<u8>>>>>, Arc<Mutex<usize>>) {
            let sent: SentLog = Arc::default();
            let replies: Arc<Mutex<VecDeque<Result<Vec<u8>>>>> = Arc::default();
            let receives: Arc<Mutex<usize>> = Arc::default();
            (
                FakeGroup {
                    sent: sent.clone(),
                    replies: replies.clone(),
                    receives: receives.clone(),
                },
                sent,
                replies,
                receives,
            )
        }
    }

    #[async_trait]
    impl PeerGroup for FakeGroup {
        async fn broadcast_to_all(&mut self, tag: u32, message: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push((tag, message.to_vec()));
            Ok(())
        }

        async fn receive_from_root(&mut self, _tag: u32, _len: usize) -> Result<Vec<u8>> {
            *self.receives.lock().unwrap() += 1;
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(Error::ConnectionClosed))
        }
    }

    /// Scripted transport: groups become connectable when an Activity
    /// poll releases them; polls follow a canned status sequence.
    struct FakeTransport {
        available: HashMap<String, Box<dyn PeerGroup>>,
        pending: HashMap<String, Box<dyn PeerGroup>>,
        poll_script: VecDeque<PollStatus>,
        try_connect_calls: Arc<Mutex<usize>>,
        on_poll: Option<Box<dyn FnMut() + Send>>,
    }

    impl FakeTransport {
        fn new() -> Self {
            FakeTransport {
                available: HashMap::new(),
                pending: HashMap::new(),
                poll_script: VecDeque::new(),
                try_connect_calls: Arc::default(),
                on_poll: None,
            }
        }
    }

    #[async_trait]
    impl TransportProvider for FakeTransport {
        async fn try_connect(
            &mut self,
            spec: &ConnectionSpec,
        ) -> Result<Option<Box<dyn PeerGroup>>> {
            *self.try_connect_calls.lock().unwrap() += 1;
            Ok(self.available.remove(&spec.to_spec_string()))
        }

        async fn poll(&mut self, _timeout: Duration) -> PollStatus {
            if let Some(hook) = &mut self.on_poll {
                hook();
            }
            let status = self.poll_script.pop_front().unwrap_or(PollStatus::Error);
            if status == PollStatus::Activity {
                self.available.extend(self.pending.drain());
            }
            status
        }
    }

    fn data_key(url: &str) -> String {
        ServerUrl::parse(url).unwrap().data.to_spec_string()
    }

    fn render_key(url: &str) -> String {
        ServerUrl::parse(url).unwrap().render.unwrap().to_spec_string()
    }

    /// Delegate that records local pushes and answers local gathers.
    struct RecordingDelegate {
        pushes: Arc<Mutex<Vec<RoutedMessage>>>,
        gather_result: bool,
    }

    impl LocalDelegate for RecordingDelegate {
        fn push_state(&mut self, message: &RoutedMessage) {
            self.pushes.lock().unwrap().push(message.clone());
        }

        fn gather(
            &mut self,
            _location: Location,
            _info: &mut dyn Information,
            _target_object_id: u32,
        ) -> bool {
            self.gather_result
        }
    }

    async fn connected_session(
        with_render: bool,
    ) -> (Session<FakeTransport>, SentLog, SentLog) {
        let url = if with_render {
            "cdsrs://dhost/rhost"
        } else {
            "cs://dhost"
        };
        let (data_group, data_sent, _, _) = FakeGroup::new();
        let (render_group, render_sent, _, _) = FakeGroup::new();

        let mut transport = FakeTransport::new();
        transport
            .available
            .insert(data_key(url), Box::new(data_group));
        if with_render {
            transport
                .available
                .insert(render_key(url), Box::new(render_group));
        }

        let mut session = Session::new(transport);
        assert!(session.connect(url).await.unwrap());
        (session, data_sent, render_sent)
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_url() {
        let transport = FakeTransport::new();
        let calls = transport.try_connect_calls.clone();
        let mut session = Session::new(transport);

        assert!(!session.connect("http://localhost").await.unwrap());
        assert!(!session.is_alive());
        assert_eq!(*calls.lock().unwrap(), 0, "no transport attempt expected");
    }

    #[tokio::test]
    async fn test_connect_waits_through_timeouts() {
        let (group, _, _, _) = FakeGroup::new();
        let mut transport = FakeTransport::new();
        transport
            .pending
            .insert(data_key("cs://dhost"), Box::new(group));
        transport.poll_script = VecDeque::from(vec![PollStatus::Timeout, PollStatus::Activity]);

        let mut session = Session::new(transport);
        let mut progress = session.subscribe_progress();

        assert!(session.connect("cs://dhost").await.unwrap());
        assert!(session.is_alive());
        assert!(progress.has_changed().unwrap());
        assert_eq!(*progress.borrow_and_update(), CONNECT_PROGRESS);
    }

    #[tokio::test]
    async fn test_connect_partial_dual_cluster_fails() {
        let url = "cdsrs://dhost/rhost";
        let (data_group, _, _, _) = FakeGroup::new();
        let mut transport = FakeTransport::new();
        transport
            .available
            .insert(data_key(url), Box::new(data_group));
        // Render never completes; the transport then reports an error.
        transport.poll_script = VecDeque::from(vec![PollStatus::Timeout, PollStatus::Error]);

        let mut session = Session::new(transport);
        assert!(!session.connect(url).await.unwrap());
        // The data handle is kept even though the connect failed.
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn test_connect_abort_before_any_handle() {
        let mut transport = FakeTransport::new();
        transport.poll_script = VecDeque::from(vec![PollStatus::Timeout; 8]);

        let mut session = Session::new(transport);
        let abort = session.abort_handle();
        session.transport.on_poll = Some(Box::new(move || abort.abort()));

        assert!(!session.connect("cs://dhost").await.unwrap());
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn test_push_targets_client_and_data_once() {
        let (mut session, data_sent, render_sent) = connected_session(true).await;
        let pushes: Arc<Mutex<Vec<RoutedMessage>>> = Arc::default();
        session.set_local_delegate(Box::new(RecordingDelegate {
            pushes: pushes.clone(),
            gather_result: true,
        }));

        let msg = RoutedMessage::new(Location::CLIENT | Location::DATA_SERVER, b"s1".to_vec());
        session.push_state(&msg).await.unwrap();

        assert_eq!(pushes.lock().unwrap().len(), 1);
        let sent = data_sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, MESSAGE_RMI_TAG);
        let (opcode, payload) = decode_message(&sent[0].1).unwrap();
        assert_eq!(opcode, Opcode::Push);
        assert_eq!(payload, b"s1");
        assert!(render_sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_render_bits_reroute_to_data_without_render_group() {
        let (mut session, data_sent, render_sent) = connected_session(false).await;

        let msg = RoutedMessage::new(
            Location::RENDER_SERVER | Location::RENDER_SERVER_ROOT,
            b"draw".to_vec(),
        );
        session.push_state(&msg).await.unwrap();

        assert_eq!(data_sent.lock().unwrap().len(), 1);
        assert!(render_sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invoke_reaches_both_groups() {
        let (mut session, data_sent, render_sent) = connected_session(true).await;

        let msg = RoutedMessage::new(
            Location::DATA_SERVER | Location::RENDER_SERVER,
            b"op".to_vec(),
        );
        session.invoke(&msg).await.unwrap();

        let data = data_sent.lock().unwrap();
        let render = render_sent.lock().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(render.len(), 1);
        let (opcode, _) = decode_message(&data[0].1).unwrap();
        assert_eq!(opcode, Opcode::Invoke);
    }

    #[tokio::test]
    async fn test_gather_queries_only_data_when_both_addressed() {
        let url = "cdsrs://dhost/rhost";
        let (data_group, data_sent, data_replies, _) = FakeGroup::new();
        let (render_group, render_sent, _, _) = FakeGroup::new();
        let mut transport = FakeTransport::new();
        transport
            .available
            .insert(data_key(url), Box::new(data_group));
        transport
            .available
            .insert(render_key(url), Box::new(render_group));

        let mut session = Session::new(transport);
        assert!(session.connect(url).await.unwrap());

        let reply = br#"{"count":3}"#;
        {
            let mut replies = data_replies.lock().unwrap();
            replies.push_back(Ok(encode_reply_length(reply.len() as i32).to_vec()));
            replies.push_back(Ok(reply.to_vec()));
        }

        let mut info: JsonInformation<(), serde_json::Value> = JsonInformation::new("stats", ());
        let ok = session
            .gather_information(
                Location::DATA_SERVER | Location::RENDER_SERVER,
                &mut info,
                42,
            )
            .await
            .unwrap();

        assert!(ok);
        assert!(info.value.is_some());
        // The render group saw no traffic at all.
        assert!(render_sent.lock().unwrap().is_empty());

        let sent = data_sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let request = decode_gather_request(&sent[0].1).unwrap();
        assert_eq!(request.kind, "stats");
        assert_eq!(request.target_object_id, 42);
        assert_eq!(
            request.location,
            Location::DATA_SERVER | Location::RENDER_SERVER
        );
    }

    #[tokio::test]
    async fn test_gather_nonpositive_length_fails_without_payload_read() {
        let url = "cs://dhost";
        let (group, _, replies, receives) = FakeGroup::new();
        let mut transport = FakeTransport::new();
        transport.available.insert(data_key(url), Box::new(group));

        let mut session = Session::new(transport);
        assert!(session.connect(url).await.unwrap());

        replies
            .lock()
            .unwrap()
            .push_back(Ok(encode_reply_length(-1).to_vec()));

        let mut info: JsonInformation<(), serde_json::Value> = JsonInformation::new("stats", ());
        let ok = session
            .gather_information(Location::DATA_SERVER, &mut info, 1)
            .await
            .unwrap();

        assert!(!ok);
        assert_eq!(*receives.lock().unwrap(), 1, "payload must not be read");
        // The session survives a gather failure.
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn test_gather_short_reply_fails() {
        let url = "cs://dhost";
        let (group, _, replies, _) = FakeGroup::new();
        let mut transport = FakeTransport::new();
        transport.available.insert(data_key(url), Box::new(group));

        let mut session = Session::new(transport);
        assert!(session.connect(url).await.unwrap());

        {
            let mut r = replies.lock().unwrap();
            r.push_back(Ok(encode_reply_length(64).to_vec()));
            r.push_back(Err(Error::ConnectionClosed));
        }

        let mut info: JsonInformation<(), serde_json::Value> = JsonInformation::new("stats", ());
        let ok = session
            .gather_information(Location::DATA_SERVER, &mut info, 1)
            .await
            .unwrap();
        assert!(!ok);
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn test_gather_root_only_local_skips_remote() {
        let (mut session, data_sent, _) = connected_session(false).await;
        session.set_local_delegate(Box::new(RecordingDelegate {
            pushes: Arc::default(),
            gather_result: true,
        }));

        let mut info: JsonInformation<(), serde_json::Value> =
            JsonInformation::new("local-state", ()).with_root_only();
        let ok = session
            .gather_information(
                Location::CLIENT | Location::DATA_SERVER,
                &mut info,
                7,
            )
            .await
            .unwrap();

        assert!(ok);
        assert!(data_sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gather_client_only_returns_local_result() {
        let (mut session, data_sent, _) = connected_session(false).await;
        session.set_local_delegate(Box::new(RecordingDelegate {
            pushes: Arc::default(),
            gather_result: true,
        }));

        let mut info: JsonInformation<(), serde_json::Value> = JsonInformation::new("stats", ());
        let ok = session
            .gather_information(Location::CLIENT, &mut info, 7)
            .await
            .unwrap();

        assert!(ok);
        assert!(data_sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_notifies_groups() {
        let (mut session, data_sent, render_sent) = connected_session(true).await;

        session.close().await;
        assert!(!session.is_alive());

        for sent in [&data_sent, &render_sent] {
            let sent = sent.lock().unwrap();
            assert_eq!(sent.len(), 1);
            let (opcode, _) = decode_message(&sent[0].1).unwrap();
            assert_eq!(opcode, Opcode::CloseSession);
        }

        // Second close on an empty session is a no-op.
        session.close().await;
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn test_push_without_connection_is_an_error() {
        let mut session = Session::new(FakeTransport::new());
        let msg = RoutedMessage::new(Location::DATA_SERVER, b"x".to_vec());
        assert!(matches!(
            session.push_state(&msg).await,
            Err(Error::NotConnected)
        ));
    }
}
