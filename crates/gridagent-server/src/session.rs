//! One agent connection from handshake to teardown.
//!
//! After the handshake a session runs three tasks: the reader (this task),
//! which decodes inbound frames and publishes them on the bus; the writer,
//! which drains the outbound queue; and the scheduler, which enqueues
//! periodic polls and clock updates. All three stop on the session's close
//! signal.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gridagent_protocol::messages::{
    CommandGaPollMeasurements, CommandGaPropagateTime, ConfigGaTime, Direction,
};
use gridagent_protocol::{
    handshake, BusEvent, Established, FrameReader, FrameWriter, Message, ProtocolError,
};
use gridagent_telemetry::{
    log_agent_connected, log_agent_disconnected, log_agent_displaced, log_bus_error,
    log_delivery_dropped, log_protocol_error, MetricsRegistry,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::Instrument;

use crate::bus::BusClient;
use crate::config::ServerConfig;
use crate::error::{CloseReason, SessionError};
use crate::registry::{AgentInfo, CloseSignal, DeliveryPolicy, Registry, SessionHandle};

/// Everything a session needs from the server.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<Registry>,
    pub bus: BusClient,
    pub metrics: Arc<MetricsRegistry>,
}

/// State shared by the tasks of one session.
struct Shared {
    handle: SessionHandle,
    /// Set while a software image awaits the agent's verdict.
    writer_paused: AtomicBool,
    resume: Notify,
    /// Set when a poll is sent, cleared by the next `BulkMeasurements`.
    poll_pending: AtomicBool,
}

impl Shared {
    fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            writer_paused: AtomicBool::new(false),
            resume: Notify::new(),
            poll_pending: AtomicBool::new(false),
        }
    }

    fn pause_writer(&self) {
        self.writer_paused.store(true, Ordering::SeqCst);
    }

    fn resume_writer(&self) {
        self.writer_paused.store(false, Ordering::SeqCst);
        self.resume.notify_one();
    }

    fn writer_paused(&self) -> bool {
        self.writer_paused.load(Ordering::SeqCst)
    }
}

/// Run a connection to completion.
///
/// Returns why a registered session ended, or the error that prevented the
/// session from being established.
pub async fn run_session<R, W>(
    reader: R,
    writer: W,
    peer: Option<SocketAddr>,
    ctx: SessionContext,
) -> Result<CloseReason, SessionError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let config = Arc::clone(&ctx.config);
    let accepted = tokio::time::timeout(
        config.handshake_timeout,
        handshake::accept(
            reader,
            writer,
            &config.secret,
            config.max_protocol_version,
            config.max_frame_length,
        ),
    )
    .await;

    let established = match accepted {
        Ok(Ok(established)) => established,
        Ok(Err(e)) => {
            ctx.metrics.record_handshake_failure();
            return Err(SessionError::Handshake(e));
        }
        Err(_) => {
            ctx.metrics.record_handshake_failure();
            return Err(SessionError::HandshakeTimeout(config.handshake_timeout));
        }
    };

    let span = tracing::info_span!(
        "session",
        agent = %established.agent_id,
        peer = ?peer,
        version = established.version
    );
    Ok(drive(ctx, established, peer).instrument(span).await)
}

async fn drive<R, W>(
    ctx: SessionContext,
    established: Established<R, W>,
    peer: Option<SocketAddr>,
) -> CloseReason
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let Established {
        version,
        agent_id: agent,
        mut reader,
        writer,
        ..
    } = established;

    let session_id = ctx.registry.next_session_id();
    let (handle, outbound_rx, mut close_rx) = SessionHandle::new(
        session_id,
        agent,
        AgentInfo::new(version, peer),
        ctx.config.outbound_queue_capacity,
    );

    let displaced = ctx.registry.register(handle.clone());
    ctx.metrics.session_opened(displaced.is_some());
    if let Some(old) = displaced {
        log_agent_displaced!(
            session_id,
            displaced_session_id = old.session_id(),
            "newer connection replaced existing session"
        );
    }
    log_agent_connected!(session_id, "agent connected");
    publish_event(
        &ctx,
        &BusEvent::AgentConnected {
            agent,
            protocol_version: version,
            peer: peer.map(|p| p.to_string()),
        },
    )
    .await;

    let shared = Arc::new(Shared::new(handle));

    let mut writer_task = tokio::spawn(
        write_loop(
            writer,
            outbound_rx,
            Arc::clone(&shared),
            close_rx.clone(),
            ctx.config.write_timeout,
            Arc::clone(&ctx.metrics),
        )
        .in_current_span(),
    );
    let scheduler_task = tokio::spawn(
        schedule_loop(
            Arc::clone(&shared),
            Arc::clone(&ctx.config),
            Arc::clone(&ctx.metrics),
            close_rx.clone(),
        )
        .in_current_span(),
    );

    let observed = read_loop(&ctx, &shared, &mut reader, &mut close_rx).await;
    shared.handle.close(observed);
    let reason = shared.handle.close_reason().unwrap_or(observed);

    ctx.registry.unregister(agent, session_id);
    scheduler_task.abort();

    match tokio::time::timeout(ctx.config.shutdown_drain_timeout, &mut writer_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => {
            ctx.metrics.record_protocol_error(e.kind());
            tracing::warn!(error = %e, "session writer failed");
        }
        Ok(Err(e)) => tracing::warn!(error = %e, "session writer task failed"),
        Err(_) => {
            writer_task.abort();
            tracing::warn!("session writer did not finish in time");
        }
    }

    ctx.metrics.session_closed();
    log_agent_disconnected!(session_id, reason = %reason, "agent disconnected");
    publish_event(
        &ctx,
        &BusEvent::AgentDisconnected {
            agent,
            reason: reason.to_string(),
        },
    )
    .await;

    reason
}

async fn read_loop<R>(
    ctx: &SessionContext,
    shared: &Shared,
    reader: &mut FrameReader<R>,
    close_rx: &mut watch::Receiver<CloseSignal>,
) -> CloseReason
where
    R: AsyncRead + Unpin,
{
    let idle_timeout = ctx.config.idle_timeout;
    loop {
        let result = tokio::select! {
            biased;
            _ = close_rx.changed() => {
                if let CloseSignal::Close(reason) = *close_rx.borrow_and_update() {
                    return reason;
                }
                continue;
            }
            result = tokio::time::timeout(idle_timeout, reader.read_message()) => result,
        };

        let message = match result {
            Err(_) => return CloseReason::IdleTimeout,
            Ok(Err(ProtocolError::EndOfStream)) => return CloseReason::PeerClosed,
            Ok(Err(e)) => {
                let kind = e.kind();
                ctx.metrics.record_protocol_error(kind.as_str());
                log_protocol_error!(kind = %kind, error = %e, "closing session");
                return CloseReason::Protocol(kind);
            }
            Ok(Ok(message)) => message,
        };

        let name = message.message_type().name();
        ctx.metrics.record_frame_received(name);
        tracing::debug!(message = name, "frame received");
        handle_upstream(ctx, shared, message).await;
    }
}

async fn handle_upstream(ctx: &SessionContext, shared: &Shared, message: Message) {
    let name = message.message_type().name();
    if message.direction() == Direction::Downstream {
        tracing::warn!(message = name, "agent sent a server-to-agent message, ignoring");
        return;
    }

    match &message {
        Message::BulkMeasurements(_) => {
            shared.poll_pending.store(false, Ordering::SeqCst);
        }
        Message::NotificationGaTime(m) => {
            sync_time(ctx, shared, m.timestamp).await;
        }
        Message::AcknowledgementGaSoftware(_) | Message::AcknowledgementGpSoftware(_) => {
            tracing::info!(message = name, "software update accepted");
            shared.resume_writer();
        }
        Message::ErrorGaSoftware(_) | Message::ErrorGpSoftware(_) => {
            tracing::warn!(message = name, "software update rejected by agent");
            shared.resume_writer();
        }
        Message::InfoAgentVersions(m) => {
            let serial = u32::try_from(m.serial).unwrap_or_else(|_| {
                tracing::warn!(serial = m.serial, "negative agent serial, storing 0");
                0
            });
            shared.handle.update_info(|info| {
                info.serial = serial;
                info.device_type = Some(m.device_type);
                info.sw_version = Some(m.sw_version.clone());
                info.hw_revision = Some(m.hw_revision.clone());
            });
            tracing::info!(
                serial,
                device_type = m.device_type,
                sw_version = %m.sw_version,
                hw_revision = %m.hw_revision,
                "agent versions"
            );
        }
        Message::InfoEventLog(m) => {
            tracing::info!(code = m.code, text = %m.text, at = %m.timestamp, "agent event log");
        }
        _ => {}
    }

    if let Some(event) = BusEvent::from_upstream(shared.handle.agent(), &message) {
        publish_event(ctx, &event).await;
    }
}

/// Answer an agent clock report: confirm it when close enough, otherwise
/// push the server clock.
async fn sync_time(ctx: &SessionContext, shared: &Shared, agent_time: DateTime<Utc>) {
    let now = Utc::now();
    let offset = (now - agent_time).num_seconds().unsigned_abs();
    let reply = if offset <= ctx.config.time_sync_tolerance.as_secs() {
        Message::from(CommandGaPropagateTime)
    } else {
        tracing::info!(offset_secs = offset, "agent clock off, sending server time");
        Message::from(ConfigGaTime { timestamp: now })
    };
    enqueue(&shared.handle, &ctx.metrics, reply).await;
}

/// Queue session-generated traffic. Never blocks the caller; returns whether
/// the message was queued.
async fn enqueue(handle: &SessionHandle, metrics: &MetricsRegistry, message: Message) -> bool {
    let name = message.message_type().name();
    match handle.deliver(message, DeliveryPolicy::Drop).await {
        Ok(()) => true,
        Err(e) => {
            metrics.record_delivery_dropped(e.reason());
            log_delivery_dropped!(message = name, reason = e.reason(), "outbound message dropped");
            false
        }
    }
}

async fn publish_event(ctx: &SessionContext, event: &BusEvent) {
    if let Err(e) = ctx.bus.publish_json(&event.routing_key(), event).await {
        ctx.metrics.record_bus_publish_failure();
        log_bus_error!(bus_event = event.name(), error = %e, "failed to publish event");
    }
}

async fn write_loop<W>(
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::Receiver<Message>,
    shared: Arc<Shared>,
    mut close_rx: watch::Receiver<CloseSignal>,
    write_timeout: Duration,
    metrics: Arc<MetricsRegistry>,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    let result = loop {
        if shared.writer_paused() {
            tokio::select! {
                _ = shared.resume.notified() => continue,
                _ = close_rx.changed() => break Ok(()),
            }
        }

        let message = tokio::select! {
            biased;
            _ = close_rx.changed() => break Ok(()),
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break Ok(()),
            },
        };

        if let Err(e) = write_one(&mut writer, &message, &shared, write_timeout, &metrics).await {
            shared.handle.close(CloseReason::WriteFailed);
            break Err(e);
        }
    };

    // on shutdown, flush what is already queued; otherwise it is dropped
    if result.is_ok() && shared.handle.close_reason() == Some(CloseReason::Shutdown) {
        while !shared.writer_paused() {
            let Ok(message) = outbound.try_recv() else {
                break;
            };
            if write_one(&mut writer, &message, &shared, write_timeout, &metrics)
                .await
                .is_err()
            {
                break;
            }
        }
    }

    outbound.close();
    while outbound.try_recv().is_ok() {
        metrics.record_delivery_dropped("session_closed");
    }
    let _ = tokio::time::timeout(write_timeout, writer.shutdown()).await;
    result
}

async fn write_one<W>(
    writer: &mut FrameWriter<W>,
    message: &Message,
    shared: &Shared,
    write_timeout: Duration,
    metrics: &MetricsRegistry,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    let name = message.message_type().name();
    let frame = match message.encode(writer.version()) {
        Ok(frame) => frame,
        Err(e) => {
            metrics.record_delivery_dropped("unencodable");
            log_delivery_dropped!(message = name, error = %e, "cannot encode outbound message");
            return Ok(());
        }
    };

    // pause before writing so a fast acknowledgement cannot be missed
    if matches!(
        message,
        Message::ConfigGaSoftware(_) | Message::ConfigGpSoftware(_)
    ) {
        shared.pause_writer();
    }

    match tokio::time::timeout(write_timeout, writer.write_frame(&frame)).await {
        Ok(Ok(())) => {
            metrics.record_frame_sent(name, frame.len());
            tracing::debug!(message = name, size = frame.len(), "frame sent");
            Ok(())
        }
        Ok(Err(e)) => Err(SessionError::Write(e)),
        Err(_) => Err(SessionError::WriteTimeout(write_timeout)),
    }
}

async fn schedule_loop(
    shared: Arc<Shared>,
    config: Arc<ServerConfig>,
    metrics: Arc<MetricsRegistry>,
    mut close_rx: watch::Receiver<CloseSignal>,
) {
    let mut time_sync = config.time_sync_interval.map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let mut poll = config.poll_interval.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + config.poll_start_delay, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            _ = close_rx.changed() => return,
            _ = tick(&mut time_sync) => {
                let message = ConfigGaTime { timestamp: Utc::now() };
                enqueue(&shared.handle, &metrics, message.into()).await;
            }
            _ = tick(&mut poll) => {
                if shared.writer_paused() {
                    tracing::debug!("software update in progress, skipping poll");
                    continue;
                }
                if shared.poll_pending.swap(true, Ordering::SeqCst) {
                    tracing::warn!("previous poll unanswered, closing session");
                    shared.handle.close(CloseReason::PollTimeout);
                    return;
                }
                // a poll that never reached the queue is not awaiting an answer
                if !enqueue(&shared.handle, &metrics, CommandGaPollMeasurements.into()).await {
                    shared.poll_pending.store(false, Ordering::SeqCst);
                }
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
