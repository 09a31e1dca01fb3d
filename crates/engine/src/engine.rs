//! Call engine: ARI event loop and per-call lifecycle
//!
//! One engine per process. The ARI event loop dispatches Stasis entries:
//! fresh inbound channels become calls, `(transfer, <call_id>)` entries are
//! transfer targets answering, `(outbound_amd, ...)` entries are dialer
//! originations re-entering after the AMD dialplan hop. Each call then runs
//! in its own task set: ingress, provider events (the coordinator), and
//! the egress pacer inside the playback manager.
//!
//! Cleanup is idempotent: PBX hangup, engine hangup and provider close can
//! race, and the post-call phase fires at most once per call.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use phone_agent_audio::{alaw_decode, mulaw_decode, pcm16_from_bytes, DcBlocker, Reframer};
use phone_agent_config::{
    CallContextConfig, ConfigManager, MediaTransportKind, Settings,
};
use phone_agent_core::{
    AgentEvent, AudioEncoding, AudioFormat, CallDirection, CallIdentity, CallOutcome, CallSession,
    LanguageModel, PostCallContext, PreCallContext, ToolPhase, TurnRole,
};
use phone_agent_dialer::{AmdDecision, AmdEntry, Dialer};
use phone_agent_persistence::PersistenceLayer;
use phone_agent_providers::{ProviderFactory, SessionParams, SharedProviderRegistry};
use phone_agent_tools::{
    dispatch_post_call, run_pre_call, schema, substitute, CallActions, SharedToolRegistry,
    ToolError,
};
use phone_agent_transport::{
    AriClient, AriEvent, Channel, OriginateParams, PlaybackManager, TransportPlan,
};

use crate::coordinator::{CallEnd, CallEvent, Coordinator};
use crate::gating::{FrameDecision, GatingManager};
use crate::media::{bind_rtp, MediaHub, MediaStream};
use crate::store::{CallCommand, CallHandle, SessionStore};
use crate::EngineError;

/// Pre-call tools slower than this trigger the hold prompt.
const HOLD_PROMPT_AFTER: Duration = Duration::from_millis(500);
/// How long we wait for the PBX to connect the media leg.
const MEDIA_TIMEOUT: Duration = Duration::from_secs(10);
/// Prefix for external media channel ids so the event loop can tell them
/// from caller channels.
const MEDIA_CHANNEL_PREFIX: &str = "pa-media-";

/// Shared handles the admin surface needs.
#[derive(Clone)]
pub struct EngineHandles {
    pub config: Arc<ConfigManager>,
    pub providers: Arc<SharedProviderRegistry>,
    pub tools: Arc<SharedToolRegistry>,
    pub persistence: PersistenceLayer,
    pub sessions: Arc<SessionStore>,
    pub ari: AriClient,
    pub dialer: Option<Arc<Dialer>>,
}

struct VoicemailDrop {
    channel_id: String,
    entry: AmdEntry,
}

/// Outbound attach bookkeeping carried by a call until cleanup.
#[derive(Clone)]
struct OutboundAttachment {
    entry: AmdEntry,
    custom_vars: HashMap<String, String>,
}

pub struct CallEngine {
    config: Arc<ConfigManager>,
    ari: AriClient,
    providers: Arc<SharedProviderRegistry>,
    tools: Arc<SharedToolRegistry>,
    persistence: PersistenceLayer,
    sessions: Arc<SessionStore>,
    media: Arc<MediaHub>,
    dialer: Option<Arc<Dialer>>,
    summarizer: Option<Arc<dyn LanguageModel>>,
    /// Voicemail drops waiting for their PlaybackFinished
    voicemail_drops: DashMap<String, VoicemailDrop>,
    /// Attachment info for outbound calls, keyed by caller channel id
    outbound: DashMap<String, OutboundAttachment>,
}

impl CallEngine {
    pub async fn new(
        config: Arc<ConfigManager>,
        ari: AriClient,
        providers: Arc<SharedProviderRegistry>,
        tools: Arc<SharedToolRegistry>,
        persistence: PersistenceLayer,
        dialer: Option<Arc<Dialer>>,
    ) -> Result<Arc<Self>, EngineError> {
        let settings = config.get();
        let media = MediaHub::start(&settings.media.audiosocket_bind).await?;

        let summarizer: Option<Arc<dyn LanguageModel>> = settings
            .summarizer
            .as_ref()
            .map(|endpoint| {
                Arc::new(phone_agent_providers::llm::OpenAiCompatLlm::new(endpoint.clone()))
                    as Arc<dyn LanguageModel>
            });

        Ok(Arc::new(Self {
            config,
            ari,
            providers,
            tools,
            persistence,
            sessions: Arc::new(SessionStore::new()),
            media,
            dialer,
            summarizer,
            voicemail_drops: DashMap::new(),
            outbound: DashMap::new(),
        }))
    }

    pub fn handles(self: &Arc<Self>) -> EngineHandles {
        EngineHandles {
            config: self.config.clone(),
            providers: self.providers.clone(),
            tools: self.tools.clone(),
            persistence: self.persistence.clone(),
            sessions: self.sessions.clone(),
            ari: self.ari.clone(),
            dialer: self.dialer.clone(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Consume the ARI event stream until shutdown, then drain calls.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.ari.connect_events();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => self.clone().dispatch(event),
                    None => {
                        tracing::error!("ari event stream ended");
                        break;
                    }
                }
            }
        }

        tracing::info!(active = self.sessions.len(), "shutdown: draining calls");
        self.sessions.broadcast(CallCommand::Shutdown);
        let deadline = Instant::now() + Duration::from_secs(10);
        while !self.sessions.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn dispatch(self: Arc<Self>, event: AriEvent) {
        match event {
            AriEvent::StasisStart { args, channel } => {
                tokio::spawn(async move {
                    self.handle_stasis_start(args, channel).await;
                });
            }
            AriEvent::StasisEnd { .. } => {}
            AriEvent::ChannelDestroyed { channel, cause, .. } => {
                if let Some(handle) = self.sessions.find_by_channel(&channel.id) {
                    handle.send(CallCommand::Hangup);
                } else if let Some(dialer) = self.dialer.clone() {
                    tokio::spawn(async move {
                        dialer.note_channel_destroyed(&channel.id, cause).await;
                    });
                }
            }
            AriEvent::ChannelDtmfReceived { channel, digit } => {
                if let Some(handle) = self.sessions.find_by_channel(&channel.id) {
                    if let Some(d) = digit.chars().next() {
                        handle.send(CallCommand::Digit(d));
                    }
                }
            }
            AriEvent::PlaybackFinished { playback } => {
                if let Some((_, pending)) = self.voicemail_drops.remove(&playback.id) {
                    tokio::spawn(async move {
                        self.finish_voicemail_drop(pending).await;
                    });
                }
            }
            AriEvent::Unknown => {}
        }
    }

    async fn handle_stasis_start(self: Arc<Self>, args: Vec<String>, channel: Channel) {
        // Our own external-media legs also enter Stasis; ignore them.
        if channel.id.starts_with(MEDIA_CHANNEL_PREFIX) {
            return;
        }

        if args.first().map(String::as_str) == Some("transfer") {
            let call_id = args.get(1).cloned().unwrap_or_default();
            self.handle_transfer_entry(&call_id, &channel).await;
            return;
        }

        if let Some(entry) = AmdEntry::parse(&args) {
            self.handle_amd_entry(entry, channel).await;
            return;
        }

        // Fresh inbound call.
        let engine = self.clone();
        let channel_id = channel.id.clone();
        if let Err(e) = engine.run_call(channel, None).await {
            tracing::error!(channel = %channel_id, "inbound call failed: {e}");
        }
    }

    /// Transfer target answered: swap it into the bridge for the AI leg.
    async fn handle_transfer_entry(&self, call_id: &str, channel: &Channel) {
        let Some(handle) = self.sessions.get(call_id) else {
            tracing::warn!(call_id, "transfer target arrived for unknown call");
            let _ = self.ari.hangup(&channel.id).await;
            return;
        };

        let swap = async {
            self.ari
                .remove_from_bridge(&handle.bridge_id, &handle.media_channel_id)
                .await?;
            self.ari.add_to_bridge(&handle.bridge_id, &channel.id).await
        };
        match swap.await {
            Ok(()) => handle.send(CallCommand::TransferComplete {
                channel_id: channel.id.clone(),
            }),
            Err(e) => handle.send(CallCommand::TransferFailed {
                reason: e.to_string(),
            }),
        }
    }

    /// Outbound origination re-entered after the AMD hop.
    async fn handle_amd_entry(self: Arc<Self>, entry: AmdEntry, channel: Channel) {
        let Some(dialer) = self.dialer.clone() else {
            tracing::error!("amd entry without a dialer configured");
            let _ = self.ari.hangup(&channel.id).await;
            return;
        };
        dialer.forget_attempt(&entry.attempt_id);

        let decision = match dialer.decide_amd(&entry).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(attempt = %entry.attempt_id, "amd decision failed: {e}");
                let _ = self.ari.hangup(&channel.id).await;
                return;
            }
        };

        match decision {
            AmdDecision::AttachAi { campaign, lead, .. } => {
                self.outbound.insert(
                    channel.id.clone(),
                    OutboundAttachment {
                        entry,
                        custom_vars: lead.custom_vars.clone(),
                    },
                );
                let attachment = OutboundCall {
                    context_name: campaign.context_name.clone(),
                    called_number: lead.number.clone(),
                    caller_number: campaign.caller_id.clone().unwrap_or_default(),
                };
                let channel_id = channel.id.clone();
                if let Err(e) = self.run_call(channel, Some(attachment)).await {
                    tracing::error!(channel = %channel_id, "outbound attach failed: {e}");
                }
            }
            AmdDecision::HangupConsentDenied => {
                let _ = self.ari.hangup(&channel.id).await;
                if let Err(e) = dialer.finish_attempt(&entry, "consent_denied", false, None).await {
                    tracing::error!("attempt bookkeeping failed: {e}");
                }
            }
            AmdDecision::HangupConsentTimeout => {
                let _ = self.ari.hangup(&channel.id).await;
                if let Err(e) = dialer.finish_attempt(&entry, "consent_timeout", false, None).await {
                    tracing::error!("attempt bookkeeping failed: {e}");
                }
            }
            AmdDecision::VoicemailDrop { media_uri } => {
                match self.ari.play_media(&channel.id, &media_uri).await {
                    Ok(playback_id) => {
                        // Hang up on PlaybackFinished; the message plays out.
                        self.voicemail_drops.insert(
                            playback_id,
                            VoicemailDrop {
                                channel_id: channel.id.clone(),
                                entry,
                            },
                        );
                    }
                    Err(e) => {
                        tracing::warn!("voicemail drop playback failed: {e}");
                        let _ = self.ari.hangup(&channel.id).await;
                        let _ = dialer
                            .finish_attempt(&entry, "machine_detected", true, None)
                            .await;
                    }
                }
            }
            AmdDecision::HangupMachine => {
                let _ = self.ari.hangup(&channel.id).await;
                if let Err(e) = dialer
                    .finish_attempt(&entry, "machine_detected", true, None)
                    .await
                {
                    tracing::error!("attempt bookkeeping failed: {e}");
                }
            }
        }
    }

    async fn finish_voicemail_drop(&self, drop: VoicemailDrop) {
        let _ = self.ari.hangup(&drop.channel_id).await;
        if let Some(dialer) = &self.dialer {
            if let Err(e) = dialer
                .finish_attempt(&drop.entry, "voicemail_dropped", true, None)
                .await
            {
                tracing::error!("voicemail attempt bookkeeping failed: {e}");
            }
        }
    }

    /// Resolve the context for a call: explicit channel variable, then DID,
    /// then the configured default.
    fn resolve_context(
        settings: &Settings,
        channel: &Channel,
        outbound: Option<&OutboundCall>,
    ) -> Result<(String, CallContextConfig), EngineError> {
        if let Some(outbound) = outbound {
            let context = settings
                .contexts
                .get(&outbound.context_name)
                .cloned()
                .ok_or_else(|| EngineError::NoContext(outbound.context_name.clone()))?;
            return Ok((outbound.context_name.clone(), context));
        }

        if let Some(vars) = &channel.channelvars {
            if let Some(name) = vars.get("PA_CONTEXT") {
                if let Some(context) = settings.contexts.get(name) {
                    return Ok((name.clone(), context.clone()));
                }
                tracing::warn!(context = %name, "PA_CONTEXT names an unknown context");
            }
        }

        let did = &channel.dialplan.exten;
        for (name, context) in &settings.contexts {
            if context.dids.iter().any(|d| d == did) {
                return Ok((name.clone(), context.clone()));
            }
        }

        settings
            .contexts
            .get(&settings.default_context)
            .map(|context| (settings.default_context.clone(), context.clone()))
            .ok_or_else(|| EngineError::NoContext(format!("no context for DID {did}")))
    }

    /// Full lifecycle of one call. Any error unwinds into cleanup with
    /// outcome `error`.
    async fn run_call(
        self: Arc<Self>,
        channel: Channel,
        outbound: Option<OutboundCall>,
    ) -> Result<(), EngineError> {
        let settings = self.config.get();
        let tools = self.tools.snapshot();
        let providers = self.providers.snapshot();

        let (context_name, context) =
            Self::resolve_context(settings.as_ref(), &channel, outbound.as_ref())?;
        let factory = providers
            .get(&context.provider)
            .ok_or_else(|| EngineError::UnknownProvider(context.provider.clone()))?;
        let profile_config = settings
            .profiles
            .get(&context.audio_profile)
            .ok_or_else(|| EngineError::UnknownProfile(context.audio_profile.clone()))?;
        let profile = profile_config.to_profile();

        let direction = if outbound.is_some() {
            CallDirection::Outbound
        } else {
            CallDirection::Inbound
        };
        let (caller_number, called_number) = match &outbound {
            Some(out) => (out.caller_number.clone(), out.called_number.clone()),
            None => (channel.caller.number.clone(), channel.dialplan.exten.clone()),
        };

        let mut session = CallSession::new(
            &channel.id,
            caller_number,
            called_number,
            &context_name,
            direction,
        );
        session.provider_name = context.provider.clone();
        let session = Arc::new(Mutex::new(session));

        tracing::info!(
            call_id = %channel.id,
            context = %context_name,
            provider = %context.provider,
            profile = %context.audio_profile,
            %direction,
            "call starting"
        );

        self.ari.answer(&channel.id).await?;

        // Media path: bridge the caller with an external media leg.
        let bridge_id = self.ari.create_bridge().await?;
        self.ari.add_to_bridge(&bridge_id, &channel.id).await?;

        let media_uuid = Uuid::new_v4();
        let media_channel_id = format!("{MEDIA_CHANNEL_PREFIX}{media_uuid}");
        let stream = match profile_config.transport {
            MediaTransportKind::Audiosocket => {
                self.ari
                    .create_external_media(
                        &media_channel_id,
                        &settings.media.audiosocket_bind,
                        asterisk_format_name(profile.wire),
                        "audiosocket",
                        Some(&media_uuid.to_string()),
                    )
                    .await?;
                let (reader, writer) = self.media.wait_for(media_uuid, MEDIA_TIMEOUT).await?;
                MediaStream::Socket { reader, writer }
            }
            MediaTransportKind::Rtp => {
                let rtp = bind_rtp(
                    &settings.media.rtp_bind_host,
                    settings.media.rtp_port_min,
                    settings.media.rtp_port_max,
                    profile.wire,
                )
                .await?;
                let local = rtp.local_addr()?;
                self.ari
                    .create_external_media(
                        &media_channel_id,
                        &local.to_string(),
                        asterisk_format_name(profile.wire),
                        "rtp",
                        None,
                    )
                    .await?;
                MediaStream::Rtp(rtp)
            }
        };
        self.ari.add_to_bridge(&bridge_id, &media_channel_id).await?;

        // Call bus + handle, registered before tools can reference the call.
        let (bus_tx, bus_rx) = mpsc::channel::<CallEvent>(512);
        let (command_tx, mut command_rx) = mpsc::channel::<CallCommand>(32);
        {
            let bus_tx = bus_tx.clone();
            tokio::spawn(async move {
                while let Some(command) = command_rx.recv().await {
                    if bus_tx.send(CallEvent::Command(command)).await.is_err() {
                        return;
                    }
                }
            });
        }
        let handle = CallHandle {
            session: session.clone(),
            commands: command_tx,
            channel_id: channel.id.clone(),
            bridge_id: bridge_id.clone(),
            media_channel_id: media_channel_id.clone(),
        };
        self.sessions.insert(&channel.id, handle);

        let result = self
            .clone()
            .drive_call(
                settings.as_ref(),
                &context,
                &context_name,
                factory.clone(),
                profile,
                session.clone(),
                stream,
                bus_tx,
                bus_rx,
                outbound.is_some(),
            )
            .await;

        // Cleanup. Idempotent against racing hangups: every ARI delete
        // treats "already gone" as success.
        let end = match result {
            Ok(end) => end,
            Err(e) => {
                tracing::error!(call_id = %channel.id, "call error: {e}");
                self.play_failure_prompt(&context, &channel.id).await;
                CallEnd::Error(e.to_string())
            }
        };
        self.cleanup(
            &channel.id,
            &bridge_id,
            &media_channel_id,
            session,
            factory.pipeline_components(),
            &context,
            end,
            tools,
        )
        .await;
        Ok(())
    }

    /// The in-call portion: pre-call tools, provider session, task trio.
    #[allow(clippy::too_many_arguments)]
    async fn drive_call(
        self: Arc<Self>,
        settings: &Settings,
        context: &CallContextConfig,
        context_name: &str,
        factory: Arc<dyn ProviderFactory>,
        profile: phone_agent_core::AudioProfile,
        session: Arc<Mutex<CallSession>>,
        stream: MediaStream,
        bus_tx: mpsc::Sender<CallEvent>,
        bus_rx: mpsc::Receiver<CallEvent>,
        is_outbound: bool,
    ) -> Result<CallEnd, EngineError> {
        let tools = self.tools.snapshot();
        let call_id = session.lock().call_id.clone();

        let plan = TransportPlan::plan(&context.audio_profile, &profile, &factory.capabilities())?;

        // Pre-call enrichment, with the hold prompt if the phase runs long.
        let identity = identity_of(&session);
        let custom_vars = self
            .outbound
            .get(&call_id)
            .map(|attachment| attachment.custom_vars.clone())
            .unwrap_or_default();
        let pre_tools = tools.collect_for_context(
            ToolPhase::PreCall,
            &context.pre_call_tools,
            context.disable_global_pre_call,
        );
        let pre_ctx = PreCallContext {
            identity: identity.clone(),
            custom_vars,
        };

        let pre_call = run_pre_call(pre_tools, pre_ctx);
        tokio::pin!(pre_call);
        let hold_timer = tokio::time::sleep(HOLD_PROMPT_AFTER);
        tokio::pin!(hold_timer);
        let mut hold_attempted = false;
        let mut hold_playback: Option<String> = None;
        let (pre_results, invocations) = loop {
            tokio::select! {
                output = &mut pre_call => break output,
                _ = &mut hold_timer, if !hold_attempted && context.hold_prompt_media.is_some() => {
                    hold_attempted = true;
                    let media = context.hold_prompt_media.as_deref().unwrap_or_default();
                    match self.ari.play_media(&call_id, media).await {
                        Ok(id) => hold_playback = Some(id),
                        Err(e) => tracing::debug!("hold prompt failed: {e}"),
                    }
                }
            }
        };
        if let Some(playback_id) = hold_playback {
            let _ = self.ari.stop_playback(&playback_id).await;
        }

        {
            let mut locked = session.lock();
            locked.pre_call_results = pre_results;
            for invocation in invocations {
                locked.record_tool_call(invocation);
            }
        }

        // Template the prompt and greeting with call vars + pre-call
        // results. Unknown placeholders stay literal; values are inserted
        // verbatim and never re-expanded.
        let mut vars = identity.variables();
        vars.extend(session.lock().pre_call_results.clone());
        let instructions = substitute(&context.system_prompt, &vars);
        let greeting = match context.greeting_template.is_empty() {
            true => None,
            false => Some(substitute(&context.greeting_template, &vars)),
        };

        // Tool schemas in this provider's shape.
        let in_call_tools = tools.collect_for_context(
            ToolPhase::InCall,
            &context.in_call_tools,
            context.disable_global_in_call,
        );
        let definitions: Vec<_> = in_call_tools.iter().map(|tool| tool.definition()).collect();
        let tool_schemas = match settings
            .providers
            .get(&context.provider)
            .map(|p| p.kind)
        {
            Some(phone_agent_config::ProviderKind::Monolithic) => {
                schema::to_flat_schemas(&definitions)
            }
            _ => schema::to_nested_schemas(&definitions),
        };

        // Provider session: handshake ack happens inside start(), before
        // any audio is streamed.
        let (agent, events) = factory
            .start(SessionParams {
                call_id: call_id.clone(),
                input_format: plan.provider_input,
                output_format: plan.provider_output,
                instructions,
                tools: tool_schemas,
                greeting,
            })
            .await?;
        let plan = plan.negotiate(&agent.applied_settings())?;

        let gating = Arc::new(GatingManager::new(
            agent.gate_policy(),
            settings.gating.clone(),
            plan.wire.sample_rate_hz,
        ));
        let last_user_audio = Arc::new(Mutex::new(Instant::now()));

        // Task trio: ingress, egress writer, provider events forwarder.
        let (media_rx, sink) = stream.split();
        let (egress_tx, mut egress_rx) = mpsc::channel::<Bytes>(64);
        {
            let bus_tx = bus_tx.clone();
            tokio::spawn(async move {
                let mut sink = sink;
                while let Some(frame) = egress_rx.recv().await {
                    if let Err(e) = sink.send(&frame).await {
                        tracing::debug!("egress write failed: {e}");
                        let _ = bus_tx.send(CallEvent::Command(CallCommand::Hangup)).await;
                        return;
                    }
                }
                sink.hangup().await;
            });
        }
        spawn_ingress(
            media_rx,
            plan.clone(),
            gating.clone(),
            agent.clone(),
            bus_tx.clone(),
            last_user_audio.clone(),
        );
        {
            let bus_tx = bus_tx.clone();
            let mut events = events;
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if bus_tx.send(CallEvent::Agent(event)).await.is_err() {
                        return;
                    }
                }
            });
        }

        if is_outbound {
            session
                .lock()
                .push_turn(TurnRole::System, format!("outbound call attached ({context_name})"));
        }

        let coordinator = Coordinator {
            call_id: call_id.clone(),
            provider_name: context.provider.clone(),
            session: session.clone(),
            agent: agent.clone(),
            plan,
            playback: PlaybackManager::new(settings.playback.clone()),
            gating,
            tools: tools.clone(),
            context: context.clone(),
            egress: egress_tx,
            bus: bus_rx,
            bus_tx,
            last_user_audio,
        };
        let end = coordinator.run().await;
        agent.close().await;
        Ok(end)
    }

    async fn play_failure_prompt(&self, context: &CallContextConfig, channel_id: &str) {
        if let Some(media) = &context.failure_prompt_media {
            if self.ari.play_media(channel_id, media).await.is_ok() {
                // Give the prompt a moment before the hangup below.
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn cleanup(
        &self,
        call_id: &str,
        bridge_id: &str,
        media_channel_id: &str,
        session: Arc<Mutex<CallSession>>,
        pipeline_components: Vec<String>,
        context: &CallContextConfig,
        end: CallEnd,
        tools: Arc<phone_agent_tools::ToolRegistry>,
    ) {
        self.sessions.remove(call_id);

        let error_message = match &end {
            CallEnd::Error(message) => Some(message.clone()),
            CallEnd::ProviderClosed => Some("provider session closed".to_string()),
            _ => None,
        };

        {
            let mut locked = session.lock();
            if locked.outcome == CallOutcome::InProgress {
                locked.outcome = match end {
                    CallEnd::Transferred => CallOutcome::Transferred,
                    CallEnd::Hangup | CallEnd::PbxHangup => CallOutcome::Completed,
                    CallEnd::Shutdown => CallOutcome::Abandoned,
                    CallEnd::ProviderClosed | CallEnd::Error(_) => CallOutcome::Error,
                };
            }
        }

        // Tear the media path down. On transfer the bridge lives on with
        // the caller and the transfer target; only the media leg goes.
        let _ = self.ari.hangup(media_channel_id).await;
        if end != CallEnd::Transferred {
            let _ = self.ari.destroy_bridge(bridge_id).await;
            if end != CallEnd::PbxHangup {
                let _ = self.ari.hangup(call_id).await;
            }
        }

        let record = {
            let locked = session.lock();
            locked.to_record(pipeline_components, error_message)
        };
        if let Err(e) = self.persistence.call_history.insert(&record).await {
            tracing::error!(call_id, "call record persist failed: {e}");
        }

        // Post-call tools: at most once even when cleanup races.
        if session.lock().claim_post_call_dispatch() {
            let post_tools = tools.collect_for_context(
                ToolPhase::PostCall,
                &context.post_call_tools,
                context.disable_global_post_call,
            );
            let post_ctx = {
                let locked = session.lock();
                PostCallContext {
                    identity: CallIdentity {
                        call_id: locked.call_id.clone(),
                        direction: locked.direction,
                        caller_number: locked.caller_number.clone(),
                        called_number: locked.called_number.clone(),
                        context_name: locked.context_name.clone(),
                    },
                    duration_s: locked.duration_seconds(),
                    outcome: locked.outcome,
                    conversation_history: locked.conversation_history.clone(),
                    tool_calls: locked.tool_calls.clone(),
                    pre_call_results: locked.pre_call_results.clone(),
                    summary: None,
                    provider_name: locked.provider_name.clone(),
                }
            };
            dispatch_post_call(post_tools, post_ctx, self.summarizer.clone());
        }

        // Outbound bookkeeping.
        if let Some((_, attachment)) = self.outbound.remove(call_id) {
            if let Some(dialer) = &self.dialer {
                let (outcome, terminal) = {
                    let locked = session.lock();
                    (locked.outcome, true)
                };
                if let Err(e) = dialer
                    .finish_attempt(
                        &attachment.entry,
                        outcome.as_str(),
                        terminal,
                        Some(call_id.to_string()),
                    )
                    .await
                {
                    tracing::error!(call_id, "attempt bookkeeping failed: {e}");
                }
            }
        }

        let locked = session.lock();
        tracing::info!(
            call_id,
            outcome = %locked.outcome,
            turns = locked.metrics.total_turns,
            avg_latency_ms = locked.metrics.avg_turn_latency_ms,
            barge_ins = locked.metrics.barge_in_count,
            "call ended"
        );
    }
}

/// Engine-side implementation of the tool action seam.
pub struct EngineCallActions {
    pub ari: AriClient,
    pub sessions: Arc<SessionStore>,
    pub stasis_app: String,
}

#[async_trait::async_trait]
impl CallActions for EngineCallActions {
    async fn blind_transfer(
        &self,
        call_id: &str,
        dial_string: &str,
        virtual_extension: Option<&str>,
    ) -> Result<(), ToolError> {
        let handle = self
            .sessions
            .get(call_id)
            .ok_or_else(|| ToolError::Execution(format!("no live call {call_id}")))?;

        {
            let mut session = handle.session.lock();
            session.current_action = Some(phone_agent_core::CurrentAction {
                action_type: "transfer".to_string(),
                target: dial_string.to_string(),
                started_at: chrono::Utc::now(),
            });
            session.transfer_destination = Some(dial_string.to_string());
            session.outcome = CallOutcome::Transferred;
        }

        // Originate the target directly (never via a Local channel; that
        // breaks bidirectional audio). It answers into our app with
        // (transfer, call_id) and the event loop swaps the bridge.
        let params = OriginateParams {
            endpoint: dial_string.to_string(),
            app: Some(self.stasis_app.clone()),
            app_args: Some(format!("transfer,{call_id}")),
            caller_id: virtual_extension.map(str::to_string),
            timeout_s: Some(30),
            ..Default::default()
        };
        self.ari
            .originate(params)
            .await
            .map_err(|e| ToolError::Execution(format!("transfer originate failed: {e}")))?;
        Ok(())
    }

    async fn hangup_with_farewell(&self, call_id: &str, farewell: &str) -> Result<(), ToolError> {
        let handle = self
            .sessions
            .get(call_id)
            .ok_or_else(|| ToolError::Execution(format!("no live call {call_id}")))?;
        handle.send(CallCommand::HangupAfterFarewell {
            farewell: farewell.to_string(),
        });
        Ok(())
    }
}

struct OutboundCall {
    context_name: String,
    called_number: String,
    caller_number: String,
}

fn identity_of(session: &Arc<Mutex<CallSession>>) -> CallIdentity {
    let locked = session.lock();
    CallIdentity {
        call_id: locked.call_id.clone(),
        direction: locked.direction,
        caller_number: locked.caller_number.clone(),
        called_number: locked.called_number.clone(),
        context_name: locked.context_name.clone(),
    }
}

/// Asterisk format name for an external media channel.
fn asterisk_format_name(format: AudioFormat) -> &'static str {
    match (format.encoding, format.sample_rate_hz) {
        (AudioEncoding::Mulaw, _) => "ulaw",
        (AudioEncoding::Alaw, _) => "alaw",
        (AudioEncoding::Pcm16le, 16000) => "slin16",
        (AudioEncoding::Pcm16le, 24000) => "slin24",
        (AudioEncoding::Pcm16le, _) => "slin",
    }
}

/// Ingress task: reframe the wire stream to 20 ms, gate it, and forward
/// converted frames to the provider. The first bytes define the timing
/// origin; everything downstream paces itself off frame arrival.
fn spawn_ingress(
    mut media_rx: mpsc::Receiver<Bytes>,
    plan: TransportPlan,
    gating: Arc<GatingManager>,
    agent: Arc<dyn phone_agent_core::AgentSession>,
    bus_tx: mpsc::Sender<CallEvent>,
    last_user_audio: Arc<Mutex<Instant>>,
) {
    tokio::spawn(async move {
        let mut reframer = Reframer::new(plan.wire_frame_bytes());
        let mut dc = DcBlocker::new();
        let converter = plan.ingress_converter();

        while let Some(chunk) = media_rx.recv().await {
            for frame in reframer.push(&chunk) {
                let mut samples = match plan.wire.encoding {
                    AudioEncoding::Mulaw => mulaw_decode(&frame),
                    AudioEncoding::Alaw => alaw_decode(&frame),
                    AudioEncoding::Pcm16le => match pcm16_from_bytes(&frame) {
                        Ok(samples) => samples,
                        Err(e) => {
                            tracing::debug!("dropping malformed wire frame: {e}");
                            continue;
                        }
                    },
                };
                dc.process(&mut samples);

                let decision = gating.on_frame(&samples);
                if decision == FrameDecision::BargeIn {
                    let _ = bus_tx.send(CallEvent::BargeIn).await;
                }
                if decision == FrameDecision::Drop {
                    continue;
                }

                match converter.convert(&frame) {
                    Ok(converted) => {
                        *last_user_audio.lock() = Instant::now();
                        if agent.send_audio(Bytes::from(converted)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        // Codec-layer failure: log, drop the frame, never
                        // propagate to the provider.
                        tracing::error!("ingress conversion failed: {e}");
                    }
                }
            }
        }
        // Media stream closed: the PBX side hung up.
        let _ = bus_tx.send(CallEvent::Command(CallCommand::Hangup)).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_with(exten: &str, vars: Option<HashMap<String, String>>) -> Channel {
        serde_json::from_value(serde_json::json!({
            "id": "chan-1",
            "name": "PJSIP/trunk-00000001",
            "state": "Ring",
            "caller": {"name": "", "number": "15551000"},
            "dialplan": {"context": "from-trunk", "exten": exten, "priority": 1},
            "channelvars": vars,
        }))
        .unwrap()
    }

    fn settings_with_contexts() -> Settings {
        let mut settings = Settings::default();
        settings.providers.insert(
            "agent".into(),
            phone_agent_config::ProviderConfig {
                kind: phone_agent_config::ProviderKind::Monolithic,
                gate_policy: phone_agent_core::GatePolicy::ServerGate,
                url: Some("wss://example".into()),
                api_key_env: None,
                model: None,
                voice: None,
                handshake_timeout_s: 5,
                keepalive_interval_s: 20,
                supported_input: vec![],
                supported_output: vec![],
                stt: None,
                llm: None,
                tts: None,
            },
        );
        let mut sales = CallContextConfig {
            provider: "agent".into(),
            ..Default::default()
        };
        sales.dids.push("15551000".into());
        settings.contexts.insert("sales".into(), sales);
        settings.contexts.insert(
            "default".into(),
            CallContextConfig {
                provider: "agent".into(),
                ..Default::default()
            },
        );
        settings
    }

    #[test]
    fn context_resolves_by_did_then_default() {
        let settings = settings_with_contexts();

        let (name, _) =
            CallEngine::resolve_context(&settings, &channel_with("15551000", None), None).unwrap();
        assert_eq!(name, "sales");

        let (name, _) =
            CallEngine::resolve_context(&settings, &channel_with("19990000", None), None).unwrap();
        assert_eq!(name, "default");
    }

    #[test]
    fn channel_variable_overrides_did() {
        let settings = settings_with_contexts();
        let vars = HashMap::from([("PA_CONTEXT".to_string(), "default".to_string())]);
        let (name, _) =
            CallEngine::resolve_context(&settings, &channel_with("15551000", Some(vars)), None)
                .unwrap();
        assert_eq!(name, "default");
    }

    #[test]
    fn asterisk_format_names() {
        assert_eq!(asterisk_format_name(AudioFormat::mulaw_8k()), "ulaw");
        assert_eq!(asterisk_format_name(AudioFormat::pcm16(16000)), "slin16");
    }
}
