//! The DHCP server: receive loop, per-message state machine, eviction
//! tick, and the coalescing persistence writer.
//!
//! One task owns the transport and processes each datagram to completion,
//! so replies to a client leave in request order. The lease table sits
//! behind a single mutex; responses are built under the lock and sent
//! after it is released.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, error, info, warn};

use crate::allocator;
use crate::config::{Config, OptionMode};
use crate::error::Result;
use crate::message::{BOOT_REQUEST, DhcpMessage};
use crate::options::{DhcpOption, MessageType, OptionCode};
use crate::store::{self, ClientStore};
use crate::table::{ClientKey, ClientRecord, ClientState, LeaseTable};
use crate::transport::UdpTransport;

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

/// Hook invoked on every outbound reply after the configured-options
/// merge; interceptors may append further options.
pub trait MessageInterceptor: Send + Sync {
    fn apply(&self, request: &DhcpMessage, response: &mut DhcpMessage);
}

pub struct DhcpServer<T, S> {
    config: Arc<Config>,
    table: Arc<Mutex<LeaseTable>>,
    transport: Arc<T>,
    store: Arc<S>,
    interceptors: Vec<Box<dyn MessageInterceptor>>,
    dirty: Arc<AtomicBool>,
    wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
}

impl<T: UdpTransport, S: ClientStore> DhcpServer<T, S> {
    /// Builds the server and restores the client table from the store,
    /// discarding incomplete offers and out-of-range addresses.
    pub async fn new(config: Config, transport: T, store: S) -> Result<Self> {
        let config = Arc::new(config);

        let mut table = LeaseTable::new();
        let loaded = store.read().await?;
        for record in store::filter_loaded(loaded, &config) {
            table.insert_or_replace(record);
        }
        if !table.is_empty() {
            info!(clients = table.len(), "restored client table");
        }

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            table: Arc::new(Mutex::new(table)),
            transport: Arc::new(transport),
            store: Arc::new(store),
            interceptors: Vec::new(),
            dirty: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            shutdown,
        })
    }

    pub fn add_interceptor(&mut self, interceptor: Box<dyn MessageInterceptor>) {
        self.interceptors.push(interceptor);
    }

    /// Signals the receive loop, tick, and writer to wind down; the writer
    /// drains one final snapshot before exiting.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub async fn run(&self) -> Result<()> {
        info!(
            endpoint = %self.transport.local_endpoint(),
            pool_start = %self.config.pool_range().0,
            pool_end = %self.config.pool_range().1,
            "DHCP server starting"
        );

        let tick = tokio::spawn(tick_loop(
            Arc::clone(&self.table),
            Arc::clone(&self.config),
            Arc::clone(&self.dirty),
            Arc::clone(&self.wake),
            self.shutdown.subscribe(),
        ));
        let writer = tokio::spawn(writer_loop(
            Arc::clone(&self.table),
            Arc::clone(&self.store),
            Arc::clone(&self.dirty),
            Arc::clone(&self.wake),
            self.shutdown.subscribe(),
        ));

        let mut shutdown = self.shutdown.subscribe();
        let result = loop {
            if *shutdown.borrow_and_update() {
                break Ok(());
            }
            tokio::select! {
                _ = shutdown.changed() => break Ok(()),
                received = self.transport.receive() => match received {
                    Ok((peer, data)) => self.handle_datagram(peer, &data).await,
                    Err(error) if !error.is_fatal() => {
                        warn!(%error, "transient receive error");
                    }
                    Err(error) => {
                        error!(%error, "fatal transport error, stopping server");
                        self.shutdown.send_replace(true);
                        break Err(error);
                    }
                }
            }
        };

        let _ = tokio::join!(tick, writer);
        info!("DHCP server stopped");
        result
    }

    /// Parses and dispatches one datagram. Decode failures and policy
    /// violations are logged and dropped; nothing here can take the
    /// receive loop down.
    async fn handle_datagram(&self, peer: SocketAddr, data: &[u8]) {
        let message = match DhcpMessage::parse(data) {
            Ok(message) => message,
            Err(error) => {
                warn!(%peer, %error, "dropping undecodable datagram");
                return;
            }
        };

        if message.op != BOOT_REQUEST {
            return;
        }

        let Some(kind) = message.message_type() else {
            warn!(%peer, "dropping request without message type");
            return;
        };

        debug!(client = %message.hardware_display(), %kind, %peer, "processing request");

        let reply = {
            let mut table = self.table.lock().await;
            match kind {
                MessageType::Discover => self.on_discover(&message, &mut table),
                MessageType::Request => self.on_request(&message, &mut table),
                MessageType::Decline => self.on_decline(&message, &mut table),
                MessageType::Release => self.on_release(&message, &mut table),
                MessageType::Inform => self.on_inform(&message),
                other => {
                    debug!(%other, "ignoring message type");
                    None
                }
            }
        };

        if let Some(reply) = reply
            && let Err(error) = self.send_reply(&message, &reply).await
        {
            warn!(%error, "failed to send reply");
        }
    }

    fn on_discover(&self, request: &DhcpMessage, table: &mut LeaseTable) -> Option<DhcpMessage> {
        let key = ClientKey::from_message(request);
        let now = Utc::now();

        let mut known_ip = None;
        if let Some(record) = table.get_mut(&key)
            && matches!(record.state, ClientState::Offered | ClientState::Assigned)
            && !record.ip_address.is_unspecified()
        {
            if record.state == ClientState::Offered {
                record.offered_at = Some(now);
            }
            if let Some(name) = request.hostname() {
                record.hostname = name.to_string();
            }
            known_ip = Some(record.ip_address);
        }

        let offered_ip = match known_ip {
            Some(ip) => ip,
            None => {
                let ip = allocator::allocate(request, table, &self.config, now);
                if ip.is_unspecified() {
                    error!(
                        client = %request.hardware_display(),
                        "address pool exhausted, ignoring DISCOVER"
                    );
                    return None;
                }
                table.insert_or_replace(self.new_record(
                    request,
                    &key,
                    ClientState::Offered,
                    ip,
                    now,
                ));
                ip
            }
        };
        self.mark_dirty();

        info!(ip = %offered_ip, client = %request.hardware_display(), "OFFER");
        let mut reply = DhcpMessage::reply_to(request, MessageType::Offer, offered_ip);
        self.finalize_reply(request, &mut reply, true);
        Some(reply)
    }

    /// RFC 2131 §4.3.2: the REQUEST sub-mode follows from the presence of
    /// the server identifier and `ciaddr`.
    fn on_request(&self, request: &DhcpMessage, table: &mut LeaseTable) -> Option<DhcpMessage> {
        match request.server_identifier() {
            Some(server_id) => self.on_request_selecting(request, table, server_id),
            None if request.ciaddr.is_unspecified() => {
                self.on_request_init_reboot(request, table)
            }
            None => self.on_request_renewing(request, table),
        }
    }

    fn on_request_selecting(
        &self,
        request: &DhcpMessage,
        table: &mut LeaseTable,
        server_id: Ipv4Addr,
    ) -> Option<DhcpMessage> {
        let key = ClientKey::from_message(request);

        if server_id != self.config.server_ip {
            // The client accepted another server's offer; forget ours.
            let had_offer = table
                .get(&key)
                .is_some_and(|record| record.state == ClientState::Offered);
            if had_offer && table.remove(&key) {
                self.mark_dirty();
            }
            debug!(
                client = %request.hardware_display(),
                %server_id,
                "client selected another server"
            );
            return None;
        }

        let Some(requested) = request.requested_ip() else {
            warn!(client = %request.hardware_display(), "SELECTING without requested address");
            return Some(self.build_nak(request));
        };

        let offered = table
            .get(&key)
            .filter(|record| record.state == ClientState::Offered)
            .map(|record| record.ip_address);

        match offered {
            Some(ip) if ip == requested => {
                self.commit_lease(request, table, &key, requested);
                info!(ip = %requested, client = %request.hardware_display(), "ACK");
                Some(self.build_ack(request, requested))
            }
            Some(ip) => {
                warn!(
                    client = %request.hardware_display(),
                    offered = %ip,
                    requested = %requested,
                    "NAK: requested address does not match offer"
                );
                table.remove(&key);
                self.mark_dirty();
                Some(self.build_nak(request))
            }
            None => {
                warn!(client = %request.hardware_display(), "NAK: no outstanding offer");
                Some(self.build_nak(request))
            }
        }
    }

    fn on_request_init_reboot(
        &self,
        request: &DhcpMessage,
        table: &mut LeaseTable,
    ) -> Option<DhcpMessage> {
        let key = ClientKey::from_message(request);

        let Some(requested) = request.requested_ip() else {
            warn!(client = %request.hardware_display(), "INIT-REBOOT without requested address");
            if table.remove(&key) {
                self.mark_dirty();
            }
            return Some(self.build_nak(request));
        };

        let assigned = table
            .get(&key)
            .filter(|record| record.state == ClientState::Assigned)
            .map(|record| record.ip_address);

        if assigned == Some(requested) {
            self.commit_lease(request, table, &key, requested);
            info!(ip = %requested, client = %request.hardware_display(), "ACK (init-reboot)");
            Some(self.build_ack(request, requested))
        } else {
            warn!(
                client = %request.hardware_display(),
                requested = %requested,
                "NAK: init-reboot for unknown or mismatched lease"
            );
            if table.remove(&key) {
                self.mark_dirty();
            }
            Some(self.build_nak(request))
        }
    }

    fn on_request_renewing(
        &self,
        request: &DhcpMessage,
        table: &mut LeaseTable,
    ) -> Option<DhcpMessage> {
        let key = ClientKey::from_message(request);
        let ciaddr = request.ciaddr;
        let now = Utc::now();

        let assigned = table
            .get(&key)
            .filter(|record| record.state == ClientState::Assigned)
            .map(|record| record.ip_address);

        if assigned == Some(ciaddr) {
            self.commit_lease(request, table, &key, ciaddr);
            info!(ip = %ciaddr, client = %request.hardware_display(), "ACK (renew)");
            return Some(self.build_ack(request, ciaddr));
        }

        // Stale or missing record: adopt the client at ciaddr when the
        // address is actually free (e.g. a renewal after state was lost).
        if table.remove(&key) {
            self.mark_dirty();
        }

        if allocator::is_free(ciaddr, table, &self.config, now, true) {
            table.reclaim_released(ciaddr);
            table.insert_or_replace(self.new_record(
                request,
                &key,
                ClientState::Assigned,
                ciaddr,
                now,
            ));
            self.mark_dirty();
            info!(ip = %ciaddr, client = %request.hardware_display(), "ACK (adopted renew)");
            return Some(self.build_ack(request, ciaddr));
        }

        warn!(
            client = %request.hardware_display(),
            %ciaddr,
            "renewal collides with an address in use, ignoring"
        );
        None
    }

    fn on_decline(&self, request: &DhcpMessage, table: &mut LeaseTable) -> Option<DhcpMessage> {
        if request.server_identifier() != Some(self.config.server_ip) {
            return None;
        }

        let key = ClientKey::from_message(request);
        if let Some(record) = table.get(&key) {
            let declined = request.requested_ip().unwrap_or(record.ip_address);
            if !declined.is_unspecified() {
                table.exclude(declined, Utc::now());
                warn!(
                    ip = %declined,
                    client = %request.hardware_display(),
                    hold_seconds = self.config.decline_hold_seconds,
                    "DECLINE: address excluded from allocation"
                );
            }
            table.remove(&key);
            self.mark_dirty();
        }
        None
    }

    fn on_release(&self, request: &DhcpMessage, table: &mut LeaseTable) -> Option<DhcpMessage> {
        if request.server_identifier() != Some(self.config.server_ip) {
            return None;
        }

        let key = ClientKey::from_message(request);
        if let Some(record) = table.get_mut(&key) {
            if record.ip_address != request.ciaddr {
                // A mismatched ciaddr cannot be trusted to identify the
                // lease; drop the association entirely.
                record.ip_address = Ipv4Addr::UNSPECIFIED;
            }
            record.state = ClientState::Released;
            record.offered_at = None;
            record.lease_start = None;
            self.mark_dirty();
            info!(client = %request.hardware_display(), ciaddr = %request.ciaddr, "RELEASE");
        }
        None
    }

    fn on_inform(&self, request: &DhcpMessage) -> Option<DhcpMessage> {
        let mut reply = DhcpMessage::reply_to(request, MessageType::Ack, Ipv4Addr::UNSPECIFIED);
        self.finalize_reply(request, &mut reply, false);
        info!(client = %request.hardware_display(), ciaddr = %request.ciaddr, "ACK (inform)");
        Some(reply)
    }

    /// Moves the client's record to Assigned and restarts the lease clock.
    fn commit_lease(
        &self,
        request: &DhcpMessage,
        table: &mut LeaseTable,
        key: &ClientKey,
        ip: Ipv4Addr,
    ) {
        let now = Utc::now();
        let mut record = table
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.new_record(request, key, ClientState::Assigned, ip, now));
        record.state = ClientState::Assigned;
        record.ip_address = ip;
        record.offered_at = None;
        record.lease_start = Some(now);
        record.lease_seconds = self.config.lease_time();
        record.hardware_address = request.hardware_address().to_vec();
        if let Some(name) = request.hostname() {
            record.hostname = name.to_string();
        }
        table.insert_or_replace(record);
        self.mark_dirty();
    }

    fn new_record(
        &self,
        request: &DhcpMessage,
        key: &ClientKey,
        state: ClientState,
        ip: Ipv4Addr,
        now: DateTime<Utc>,
    ) -> ClientRecord {
        ClientRecord {
            identifier: key.as_bytes().to_vec(),
            hardware_address: request.hardware_address().to_vec(),
            hostname: request.hostname().unwrap_or_default().to_string(),
            state,
            ip_address: ip,
            offered_at: (state == ClientState::Offered).then_some(now),
            lease_start: (state == ClientState::Assigned).then_some(now),
            lease_seconds: if state == ClientState::Assigned {
                self.config.lease_time()
            } else {
                0
            },
        }
    }

    fn build_ack(&self, request: &DhcpMessage, ip: Ipv4Addr) -> DhcpMessage {
        let mut reply = DhcpMessage::reply_to(request, MessageType::Ack, ip);
        self.finalize_reply(request, &mut reply, true);
        reply
    }

    fn build_nak(&self, request: &DhcpMessage) -> DhcpMessage {
        let mut reply = DhcpMessage::reply_to(request, MessageType::Nak, Ipv4Addr::UNSPECIFIED);
        reply
            .options
            .push(DhcpOption::ServerIdentifier(self.config.server_ip));
        if request.requests(OptionCode::SubnetMask) {
            reply
                .options
                .push(DhcpOption::SubnetMask(self.config.subnet_mask));
        }
        for interceptor in &self.interceptors {
            interceptor.apply(request, &mut reply);
        }
        reply
    }

    /// Lease time (for OFFER/ACK), server identifier, subnet mask when
    /// requested, then the configured options merge and interceptors.
    fn finalize_reply(
        &self,
        request: &DhcpMessage,
        reply: &mut DhcpMessage,
        include_lease_time: bool,
    ) {
        if include_lease_time {
            reply
                .options
                .push(DhcpOption::AddressLeaseTime(self.config.lease_time()));
        }
        reply
            .options
            .push(DhcpOption::ServerIdentifier(self.config.server_ip));
        if request.requests(OptionCode::SubnetMask) {
            reply
                .options
                .push(DhcpOption::SubnetMask(self.config.subnet_mask));
        }

        let requested_codes = request.parameter_request_list();
        for configured in &self.config.options {
            let code = configured.option.code();
            let wanted =
                configured.mode == OptionMode::Force || requested_codes.contains(&code);
            if wanted && !reply.has_option(code) {
                reply.options.push(configured.option.clone());
            }
        }

        for interceptor in &self.interceptors {
            interceptor.apply(request, reply);
        }
    }

    async fn send_reply(&self, request: &DhcpMessage, reply: &DhcpMessage) -> Result<()> {
        let destination = reply_destination(request, reply);
        let encoded = reply.encode(self.config.minimum_packet_size as usize);
        self.transport
            .send(SocketAddr::V4(destination), &encoded)
            .await?;
        debug!(
            %destination,
            kind = ?reply.message_type(),
            bytes = encoded.len(),
            "reply sent"
        );
        Ok(())
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}

/// Reply routing per RFC 2131 §4.1.
fn reply_destination(request: &DhcpMessage, reply: &DhcpMessage) -> SocketAddrV4 {
    if !request.giaddr.is_unspecified() {
        return SocketAddrV4::new(request.giaddr, DHCP_SERVER_PORT);
    }
    if reply.message_type() == Some(MessageType::Nak) {
        return SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT);
    }
    if !request.ciaddr.is_unspecified() {
        return SocketAddrV4::new(request.ciaddr, DHCP_CLIENT_PORT);
    }
    if request.is_broadcast() {
        return SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT);
    }
    // RFC 2131 wants this last case unicast to yiaddr, which requires an
    // ARP entry injected before the client owns the address. Broadcast is
    // the portable fallback.
    SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
}

async fn tick_loop(
    table: Arc<Mutex<LeaseTable>>,
    config: Arc<Config>,
    dirty: Arc<AtomicBool>,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            _ = interval.tick() => {
                let evicted = {
                    let mut table = table.lock().await;
                    table.tick(Utc::now(), config.offer_expiration(), config.decline_hold())
                };
                if evicted > 0 {
                    debug!(evicted, "evicted stale table entries");
                    dirty.store(true, Ordering::Release);
                    wake.notify_one();
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn writer_loop<S: ClientStore>(
    table: Arc<Mutex<LeaseTable>>,
    store: Arc<S>,
    dirty: Arc<AtomicBool>,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            _ = wake.notified() => {
                if dirty.swap(false, Ordering::AcqRel) {
                    let snapshot = { table.lock().await.snapshot() };
                    store::write_with_retry(&*store, snapshot).await;
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    // Final drain so a clean shutdown never loses the latest table.
    if dirty.swap(false, Ordering::AcqRel) {
        let snapshot = { table.lock().await.snapshot() };
        store::write_with_retry(&*store, snapshot).await;
    }
}
