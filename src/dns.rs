// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The DNS frontend: UDP and TCP listeners answering queries from the
//! published repository.
//!
//! Both transports share one query handler.  A response is a fresh message
//! with every section written explicitly.  Only the first question of a
//! request is honored.  A/AAAA/ANY and CNAME answer from the repository
//! with NXDOMAIN plus the SOA in the authority section on a miss; NS and MX
//! are synthesized to point at this server.  Anything else is logged and
//! not responded to.  Write errors are logged and swallowed; the client
//! retries or times out.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::{MX, NS};
use hickory_proto::rr::{
    DNSClass, Name, RData, Record as WireRecord, RecordType,
};
use slog::{Logger, error, info, o};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::host::Host;
use crate::server::Server;

/// Binds the UDP socket and TCP listener on `addr` and serves until one of
/// the transports fails.  Bind failures are fatal to the caller.
pub async fn serve(server: Arc<Server>, addr: SocketAddr) -> anyhow::Result<()> {
    let udp = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("DNS server start: UDP bind to {}", addr))?;
    let tcp = TcpListener::bind(addr)
        .await
        .with_context(|| format!("DNS server start: TCP bind to {}", addr))?;

    let log = server.log().new(o!("component" => "dns"));
    info!(log, "listening for DNS requests"; "addr" => %addr);

    tokio::try_join!(
        serve_udp(
            Arc::clone(&server),
            Arc::new(udp),
            log.new(o!("transport" => "udp"))
        ),
        serve_tcp(server, tcp, log.new(o!("transport" => "tcp"))),
    )?;
    Ok(())
}

async fn serve_udp(
    server: Arc<Server>,
    socket: Arc<UdpSocket>,
    log: Logger,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 4096];
    loop {
        let (n, peer) =
            socket.recv_from(&mut buf).await.context("UDP receive")?;
        let packet = buf[..n].to_vec();
        let server = Arc::clone(&server);
        let socket = Arc::clone(&socket);
        let log = log.clone();
        tokio::spawn(async move {
            if let Some(resp) =
                handle_packet(&server, &packet, peer, &log).await
            {
                if let Err(err) = socket.send_to(&resp, peer).await {
                    error!(
                        log,
                        "error writing DNS response packet";
                        "peer" => %peer,
                        "error" => %err,
                    );
                }
            }
        });
    }
}

async fn serve_tcp(
    server: Arc<Server>,
    listener: TcpListener,
    log: Logger,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("TCP accept")?;
        let server = Arc::clone(&server);
        let log = log.clone();
        tokio::spawn(async move {
            handle_tcp_conn(server, stream, peer, log).await;
        });
    }
}

/// Serves length-prefixed DNS messages on one connection until EOF or the
/// first I/O error.  Queries that produce no response leave the connection
/// open for the next message.
async fn handle_tcp_conn(
    server: Arc<Server>,
    mut stream: TcpStream,
    peer: SocketAddr,
    log: Logger,
) {
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut packet = vec![0u8; len];
        if stream.read_exact(&mut packet).await.is_err() {
            return;
        }
        let Some(resp) = handle_packet(&server, &packet, peer, &log).await
        else {
            continue;
        };
        let resp_len = (resp.len() as u16).to_be_bytes();
        let write = async {
            stream.write_all(&resp_len).await?;
            stream.write_all(&resp).await
        };
        if let Err(err) = write.await {
            error!(
                log,
                "error writing DNS response packet";
                "peer" => %peer,
                "error" => %err,
            );
            return;
        }
    }
}

async fn handle_packet(
    server: &Server,
    packet: &[u8],
    peer: SocketAddr,
    log: &Logger,
) -> Option<Vec<u8>> {
    let req = match Message::from_vec(packet) {
        Ok(req) => req,
        Err(err) => {
            error!(
                log,
                "cannot parse DNS request";
                "peer" => %peer,
                "error" => %err,
            );
            return None;
        }
    };
    let resp = handle_query(server, &req, log).await?;
    match resp.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            error!(
                log,
                "cannot encode DNS response";
                "peer" => %peer,
                "error" => %err,
            );
            None
        }
    }
}

/// Answers a single request, or returns `None` when no response should be
/// sent at all (no question, or an unhandled query type).
pub(crate) async fn handle_query(
    server: &Server,
    req: &Message,
    log: &Logger,
) -> Option<Message> {
    // Only the first question is honored.
    let query = req.queries().first()?.clone();
    let qtype = query.query_type();
    let name = Host::from(query.name().to_string().as_str());

    match qtype {
        RecordType::A | RecordType::AAAA | RecordType::ANY => {
            if server.verbose() {
                info!(log, "request"; "qtype" => %qtype, "name" => name.wire());
            }
            Some(answer_addr(server, req, &query, &name, qtype).await)
        }
        RecordType::CNAME => {
            if server.verbose() {
                info!(log, "request for CNAME"; "name" => name.wire());
            }
            Some(answer_cname(server, req, &query, &name).await)
        }
        RecordType::NS => {
            if server.verbose() {
                info!(log, "request for NS"; "name" => name.wire());
            }
            answer_ns(server, req, &query, &name, log).await
        }
        RecordType::MX => {
            if server.verbose() {
                info!(log, "request for MX"; "name" => name.wire());
            }
            answer_mx(server, req, &query, &name, log)
        }
        other => {
            error!(log, "unhandled request"; "qtype" => %other);
            None
        }
    }
}

/// A fresh reply skeleton for `req`: same id and opcode, response bit set,
/// the (first) question echoed, all record sections empty.
fn reply_to(req: &Message, query: &Query) -> Message {
    let mut resp = Message::new();
    resp.set_id(req.id());
    resp.set_message_type(MessageType::Response);
    resp.set_op_code(req.op_code());
    resp.set_recursion_desired(req.recursion_desired());
    resp.add_query(query.clone());
    resp
}

async fn answer_addr(
    server: &Server,
    req: &Message,
    query: &Query,
    name: &Host,
    qtype: RecordType,
) -> Message {
    let mut resp = reply_to(req, query);
    let repo = server.repo_snapshot().await;
    let slot = repo.get(name).and_then(|rec| {
        if qtype == RecordType::AAAA { rec.aaaa() } else { rec.a() }
    });
    match slot {
        Some(rr) => {
            resp.add_answer(rr.clone());
        }
        None => {
            resp.set_response_code(ResponseCode::NXDomain);
            resp.add_name_server(server.soa_record().await);
        }
    }
    resp
}

async fn answer_cname(
    server: &Server,
    req: &Message,
    query: &Query,
    name: &Host,
) -> Message {
    let mut resp = reply_to(req, query);
    let repo = server.repo_snapshot().await;
    match repo.get(name).and_then(|rec| rec.cname()) {
        Some(rr) => {
            resp.add_answer(rr.clone());
        }
        None => {
            resp.set_response_code(ResponseCode::NXDomain);
            resp.add_name_server(server.soa_record().await);
        }
    }
    resp
}

/// NS is answered with a single synthesized record pointing at this server,
/// with the SOA in the authority section.
async fn answer_ns(
    server: &Server,
    req: &Message,
    query: &Query,
    name: &Host,
    log: &Logger,
) -> Option<Message> {
    let owner = parse_owner(name, log)?;
    let mut rr = WireRecord::from_rdata(
        owner,
        0,
        RData::NS(NS(server.self_name().clone())),
    );
    rr.set_dns_class(DNSClass::IN);

    let mut resp = reply_to(req, query);
    resp.add_answer(rr);
    resp.add_name_server(server.soa_record().await);
    Some(resp)
}

/// MX is synthesized for the queried name regardless of whether it exists,
/// pointing at this server with preference 10.
fn answer_mx(
    server: &Server,
    req: &Message,
    query: &Query,
    name: &Host,
    log: &Logger,
) -> Option<Message> {
    let owner = parse_owner(name, log)?;
    let mut rr = WireRecord::from_rdata(
        owner,
        3600,
        RData::MX(MX::new(10, server.self_name().clone())),
    );
    rr.set_dns_class(DNSClass::IN);

    let mut resp = reply_to(req, query);
    resp.add_answer(rr);
    Some(resp)
}

fn parse_owner(name: &Host, log: &Logger) -> Option<Name> {
    match Name::from_utf8(name.wire()) {
        Ok(owner) => Some(owner),
        Err(err) => {
            error!(
                log,
                "cannot parse queried name";
                "name" => name.wire(),
                "error" => %err,
            );
            None
        }
    }
}
