//! Connection pump (C6): accepts one client at a time, dials the real
//! server, and relays frames in both directions through the handshake
//! state machine and frame router.
//!
//! Re-expressed from the source's manual `poll(2)` loop as a single
//! `tokio` task per session driven by `tokio::select!` (§4.6/§5) --
//! grounded on the teacher crate's `ClientConnection::handle` read
//! loop, generalized to two legs instead of one and to the frame/crypto
//! layers this proxy needs that a plain lobby server doesn't.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use mitm_common::compression;
use mitm_common::frame as wire_frame;

use crate::auth_bridge::{self, JoinRequest};
use crate::capture::CaptureFile;
use crate::config::Config;
use crate::handshake::{self, Action, Direction};
use crate::router::{self, DecodedFrame, FrameHandler, IdentityHandler, OutputQueues};
use crate::session::{Phase, Session};

const READ_CHUNK: usize = 8192;

/// Which physical peer a write goes to -- independent of the direction
/// a triggering frame arrived from, since a reply goes back the way it
/// came while a forward crosses to the other leg.
#[derive(Clone, Copy)]
enum WriteLeg {
    Client,
    Server,
}

/// Top-level pump: owns the two listeners and drives at most one live
/// session at a time.
pub struct Pump {
    config: Config,
    handler: Arc<dyn FrameHandler>,
}

impl Pump {
    /// Build a pump with the identity (pure-forwarder) handler.
    pub fn new(config: Config) -> Self {
        Self::with_handler(config, Arc::new(IdentityHandler))
    }

    /// Build a pump with a caller-supplied frame handler (§9's "external
    /// handler as capability" design note).
    pub fn with_handler(config: Config, handler: Arc<dyn FrameHandler>) -> Self {
        Self { config, handler }
    }

    /// Run the proxy until SIGINT. Binds both listeners up front so
    /// initialization failures surface before any session is accepted.
    pub async fn run(self) -> Result<()> {
        let listen_addr = format!("0.0.0.0:{}", self.config.listen_port);
        let listener = TcpListener::bind(&listen_addr)
            .await
            .with_context(|| format!("binding client listener on {listen_addr}"))?;
        info!(addr = %listen_addr, "client listener bound");

        let auth_addr = format!("127.0.0.1:{}", self.config.auth_port);
        let auth_listener = TcpListener::bind(&auth_addr)
            .await
            .with_context(|| format!("binding loopback auth bridge on {auth_addr}"))?;
        info!(addr = %auth_addr, "loopback auth bridge bound");

        let (join_tx, mut join_rx) = mpsc::channel::<JoinRequest>(4);
        tokio::spawn(run_auth_listener(auth_listener, join_tx));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("SIGINT received, will stop after the current session");
                let _ = shutdown_tx.send(true);
            }
        });

        loop {
            let mut shutdown_watch = shutdown_rx.clone();
            tokio::select! {
                accepted = listener.accept() => {
                    let (client_sock, peer) = accepted.context("accepting client connection")?;
                    info!(%peer, "client connected");
                    if let Err(e) = self.run_session(client_sock, &mut join_rx, shutdown_rx.clone()).await {
                        error!(error = %e, "session ended with error");
                    }
                }
                _ = shutdown_watch.changed() => {
                    info!("shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Drive one client↔server session to completion: connect upstream,
    /// then relay frames until EOF on either leg or shutdown.
    async fn run_session(
        &self,
        client_sock: TcpStream,
        join_rx: &mut mpsc::Receiver<JoinRequest>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        client_sock.set_nodelay(true).ok();

        let upstream_addr = format!("{}:{}", self.config.upstream_host, self.config.listen_port);
        let server_sock = TcpStream::connect(&upstream_addr)
            .await
            .with_context(|| format!("connecting to upstream {upstream_addr}"))?;
        server_sock.set_nodelay(true).ok();
        info!(upstream = %upstream_addr, "connected to real server");

        let mut session = Session::new()?;
        let http_client = reqwest::Client::new();

        let mut capture = match CaptureFile::create(
            std::path::Path::new(&self.config.capture_dir),
            chrono::Utc::now(),
        )
        .await
        {
            Ok(capture) => Some(capture),
            Err(e) => {
                warn!(error = %e, "failed to open capture file, capture disabled for this session");
                None
            }
        };

        let (mut client_rd, mut client_wr) = client_sock.into_split();
        let (mut server_rd, mut server_wr) = server_sock.into_split();

        let mut client_buf = vec![0u8; READ_CHUNK];
        let mut server_buf = vec![0u8; READ_CHUNK];

        let result = loop {
            tokio::select! {
                read = client_rd.read(&mut client_buf) => {
                    match read {
                        Ok(0) => { info!("client closed connection"); break Ok(()); }
                        Ok(n) => {
                            if let Err(e) = self.on_readable(
                                &mut session,
                                Direction::ClientToServer,
                                &client_buf[..n],
                                &mut client_wr,
                                &mut server_wr,
                                &mut capture,
                                join_rx,
                                &http_client,
                            ).await {
                                break Err(e);
                            }
                        }
                        Err(e) => break Err(e.into()),
                    }
                }
                read = server_rd.read(&mut server_buf) => {
                    match read {
                        Ok(0) => { info!("server closed connection"); break Ok(()); }
                        Ok(n) => {
                            if let Err(e) = self.on_readable(
                                &mut session,
                                Direction::ServerToClient,
                                &server_buf[..n],
                                &mut client_wr,
                                &mut server_wr,
                                &mut capture,
                                join_rx,
                                &http_client,
                            ).await {
                                break Err(e);
                            }
                        }
                        Err(e) => break Err(e.into()),
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("session interrupted by shutdown signal");
                    break Ok(());
                }
            }
        };

        let _ = client_wr.shutdown().await;
        let _ = server_wr.shutdown().await;
        if let Some(capture) = capture.as_mut() {
            capture.close().await;
        }

        result
    }

    /// Handle newly-readable bytes on one leg: decrypt (if active),
    /// append to that leg's decoded receive buffer, drain every complete
    /// frame, and dispatch each one.
    #[allow(clippy::too_many_arguments)]
    async fn on_readable(
        &self,
        session: &mut Session,
        dir: Direction,
        new_bytes: &[u8],
        client_wr: &mut OwnedWriteHalf,
        server_wr: &mut OwnedWriteHalf,
        capture: &mut Option<CaptureFile>,
        join_rx: &mut mpsc::Receiver<JoinRequest>,
        http_client: &reqwest::Client,
    ) -> Result<()> {
        let start = session.rx_mut(dir).len();
        session.rx_mut(dir).extend_from_slice(new_bytes);

        if session.encryption_active {
            // Field-disjoint borrows: `cipher` and the per-leg rx buffer
            // are distinct fields, so borrowing both directly (not
            // through the `rx_mut` helper, which would erase that to
            // the borrow checker) is sound.
            let (rx, cipher) = match dir {
                Direction::ClientToServer => (&mut session.client_rx, &mut session.cipher),
                Direction::ServerToClient => (&mut session.server_rx, &mut session.cipher),
            };
            let cipher = cipher.as_mut().expect("active implies cipher present");
            let stream = match dir {
                Direction::ClientToServer => &mut cipher.client_decrypt,
                Direction::ServerToClient => &mut cipher.server_decrypt,
            };
            stream.apply(&mut rx[start..]);
        }

        loop {
            let rx = session.rx_mut(dir);
            let envelope = match wire_frame::extract_frame(rx) {
                Ok(Some((consumed, body))) => {
                    let body = body.to_vec();
                    rx.drain(..consumed);
                    body
                }
                Ok(None) => break,
                Err(e) => return Err(anyhow::anyhow!("frame extraction failed: {e}")),
            };

            let payload = compression::decompress_envelope(&envelope, session.compression_threshold)
                .map_err(|e| anyhow::anyhow!("decompression failed: {e}"))?;

            if let Some(capture) = capture.as_mut() {
                let now = chrono::Utc::now();
                capture
                    .append(
                        dir,
                        &payload,
                        now.timestamp() as u32,
                        now.timestamp_subsec_micros(),
                    )
                    .await;
            }

            self.dispatch_frame(
                session, dir, &payload, client_wr, server_wr, join_rx, http_client,
            )
            .await?;
        }

        Ok(())
    }

    /// Route one decompressed frame through the handshake state machine
    /// (IDLE/STATUS/LOGIN) or the frame router (PLAY), write whatever
    /// the dispatch produced to the right leg, and activate encryption
    /// if this was the iteration that armed it.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_frame(
        &self,
        session: &mut Session,
        dir: Direction,
        payload: &[u8],
        client_wr: &mut OwnedWriteHalf,
        server_wr: &mut OwnedWriteHalf,
        join_rx: &mut mpsc::Receiver<JoinRequest>,
        http_client: &reqwest::Client,
    ) -> Result<()> {
        let (peer_wr, own_wr, peer_leg) = match dir {
            Direction::ClientToServer => (server_wr, client_wr, WriteLeg::Server),
            Direction::ServerToClient => (client_wr, server_wr, WriteLeg::Client),
        };
        let own_leg = match peer_leg {
            WriteLeg::Client => WriteLeg::Server,
            WriteLeg::Server => WriteLeg::Client,
        };

        if session.phase == Phase::Play {
            return self
                .dispatch_play_frame(session, dir, payload, peer_wr, peer_leg, own_wr, own_leg)
                .await;
        }

        let action = handshake::process_frame(session, dir, payload)
            .map_err(|e| anyhow::anyhow!("handshake error: {e}"))?;

        match action {
            Action::Forward(frame) => {
                send_frame(session, peer_leg, peer_wr, &frame).await?;
            }
            Action::ForwardRawEnvelope(frame) => {
                send_raw_envelope(session, peer_leg, peer_wr, &frame).await?;
            }
            Action::EncryptionResponseReady(frame) => {
                send_raw_envelope(session, peer_leg, peer_wr, &frame).await?;
                self.bridge_join_request(session, join_rx, http_client).await;
                session.activate_encryption_if_pending();
            }
            Action::Terminate(reason) => {
                warn!(reason, "terminating session");
                return Err(anyhow::anyhow!("session terminated: {reason}"));
            }
        }
        Ok(())
    }

    /// PLAY-phase dispatch through the external handler capability (C7).
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_play_frame(
        &self,
        session: &mut Session,
        dir: Direction,
        frame: &[u8],
        peer_wr: &mut OwnedWriteHalf,
        peer_leg: WriteLeg,
        own_wr: &mut OwnedWriteHalf,
        own_leg: WriteLeg,
    ) -> Result<()> {
        let mut cursor = mitm_common::codec::Cursor::new(frame);
        let type_id = mitm_common::codec::read_varint(&mut cursor)
            .map_err(|e| anyhow::anyhow!("bad PLAY frame: {e}"))?;
        let payload = &frame[cursor.position()..];

        let decoded = DecodedFrame {
            direction: dir,
            type_id,
            payload,
            original: frame,
        };

        let mut queues = OutputQueues::default();
        self.handler.handle(decoded, &mut queues).await;

        let decoded_for_encode = DecodedFrame {
            direction: dir,
            type_id,
            payload,
            original: frame,
        };

        for queued in queues.forward {
            let bytes = router::encode_queued_frame(&decoded_for_encode, queued, None)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            send_frame(session, peer_leg, peer_wr, &bytes).await?;
        }
        for queued in queues.reply {
            let bytes = router::encode_queued_frame(&decoded_for_encode, queued, None)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            send_frame(session, own_leg, own_wr, &bytes).await?;
        }
        Ok(())
    }

    /// C5: once the client's AES key is decrypted and verified, drain
    /// whatever join request the loopback bridge has queued (the
    /// patched launcher's POST may already have landed) and forward a
    /// rewritten copy to the real session server. Failure is logged and
    /// non-fatal (§7).
    async fn bridge_join_request(
        &self,
        session: &mut Session,
        join_rx: &mut mpsc::Receiver<JoinRequest>,
        http_client: &reqwest::Client,
    ) {
        let join = match join_rx.try_recv() {
            Ok(join) => join,
            Err(_) => {
                warn!("no loopback join request queued yet, skipping session-server bridge");
                return;
            }
        };

        session.identity.access_token = Some(join.access_token.clone());
        session.identity.selected_profile = Some(join.selected_profile.clone());
        session.identity.server_id = Some(join.server_id.clone());

        let session_hash = mitm_common::crypto::session_hash(
            &session.server_crypto.server_id,
            &session.server_crypto.shared_key,
            &session.server_crypto.public_key_der,
        );

        if let Err(e) =
            auth_bridge::forward_join_to_session_server(http_client, &join, &session_hash).await
        {
            warn!(error = %e, "session-server join POST failed, continuing locally");
        }
    }
}

/// Accept loop for the loopback HTTP bridge: one join request per
/// accepted connection, forwarded to the pump over `join_tx`.
async fn run_auth_listener(listener: TcpListener, join_tx: mpsc::Sender<JoinRequest>) {
    loop {
        let (mut stream, _peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "auth bridge accept failed");
                continue;
            }
        };
        let join_tx = join_tx.clone();
        tokio::spawn(async move {
            match auth_bridge::handle_join_request(&mut stream).await {
                Ok(join) => {
                    let _ = join_tx.send(join).await;
                }
                Err(e) => warn!(error = %e, "malformed loopback join request"),
            }
        });
    }
}

/// Write a frame using the session's ordinary compression threshold
/// logic, then encrypt the fully-framed bytes in place if encryption is
/// active on `leg` (data flow: reframe → compress → encrypt → socket).
async fn send_frame(session: &mut Session, leg: WriteLeg, wr: &mut OwnedWriteHalf, payload: &[u8]) -> Result<()> {
    let enveloped = compression::compress_envelope(payload, session.compression_threshold)
        .map_err(|e| anyhow::anyhow!("compression failed: {e}"))?;
    write_leg(session, leg, wr, &enveloped).await
}

/// Write a frame using the defensive unconditional `U=0` envelope
/// (§4.4 point 7), only ever used for the synthesized
/// EncryptionRequest/Response, then encrypt if active.
async fn send_raw_envelope(
    session: &mut Session,
    leg: WriteLeg,
    wr: &mut OwnedWriteHalf,
    payload: &[u8],
) -> Result<()> {
    let enveloped = compression::wrap_uncompressed(payload, session.compression_threshold);
    write_leg(session, leg, wr, &enveloped).await
}

/// Frame `enveloped`, encrypt in place on `leg`'s encrypt stream if
/// encryption is active, and write it to the socket. This is the single
/// choke point every outbound frame passes through, matching the data
/// flow's `reframe → compress → encrypt → transmit buffer` order.
async fn write_leg(session: &mut Session, leg: WriteLeg, wr: &mut OwnedWriteHalf, enveloped: &[u8]) -> Result<()> {
    let mut out = Vec::with_capacity(enveloped.len() + 5);
    wire_frame::write_frame(&mut out, enveloped);

    // Encryption wraps the whole framed byte stream, length prefix
    // included -- the mirror image of the read path, which decrypts
    // before any varint is parsed out of the receive buffer.
    if session.encryption_active {
        let cipher = session.cipher.as_mut().expect("active implies cipher present");
        let stream = match leg {
            WriteLeg::Client => &mut cipher.client_encrypt,
            WriteLeg::Server => &mut cipher.server_encrypt,
        };
        stream.apply(&mut out);
    }

    wr.write_all(&out).await.context("writing frame")?;
    Ok(())
}
