//! Key-value data path over the memcached binary protocol.
//!
//! Each [`KvConnection`] is one authenticated socket bound to a bucket.
//! [`BucketRouter`] hashes keys onto vBuckets, keeps one lazily opened
//! connection per data node and caches collection ids.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::Keyspace;
use crate::constants::KV_CLIENT_NAME;
use crate::error::{CbError, CbResult};

pub const HEADER_LEN: usize = 24;
const REQ_MAGIC: u8 = 0x80;
const RES_MAGIC: u8 = 0x81;

pub mod opcode {
    pub const GET: u8 = 0x00;
    pub const SET: u8 = 0x01;
    pub const DELETE: u8 = 0x04;
    pub const NOOP: u8 = 0x0a;
    pub const HELLO: u8 = 0x1f;
    pub const SASL_AUTH: u8 = 0x21;
    pub const SELECT_BUCKET: u8 = 0x89;
    pub const GET_COLLECTION_ID: u8 = 0xbb;
    pub const SUBDOC_GET: u8 = 0xc5;
    pub const SUBDOC_DICT_UPSERT: u8 = 0xc8;
}

pub mod status {
    pub const SUCCESS: u16 = 0x00;
    pub const KEY_NOT_FOUND: u16 = 0x01;
    pub const KEY_EXISTS: u16 = 0x02;
    pub const NOT_MY_VBUCKET: u16 = 0x07;
    pub const AUTH_ERROR: u16 = 0x20;
    pub const NO_BUCKET: u16 = 0x08;
    pub const BUSY: u16 = 0x85;
    pub const TEMP_FAIL: u16 = 0x86;
    pub const UNKNOWN_COLLECTION: u16 = 0x88;
    pub const SUBDOC_PATH_NOT_FOUND: u16 = 0xc0;
}

mod feature {
    pub const XERROR: u16 = 0x07;
    pub const SELECT_BUCKET: u16 = 0x08;
    pub const JSON: u16 = 0x0b;
    pub const COLLECTIONS: u16 = 0x12;
}

const DATATYPE_JSON: u8 = 0x01;
/// Common flags marking a JSON document
const JSON_FLAGS: u32 = 0x0200_0006;
const SUBDOC_FLAG_MKDIR_P: u8 = 0x01;

// =============================================================================
// Frames
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct Request {
    pub opcode: u8,
    pub vbucket: u16,
    pub datatype: u8,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Request {
    pub fn new(opcode: u8) -> Self {
        Self {
            opcode,
            ..Default::default()
        }
    }

    pub fn encode(&self, opaque: u32) -> BytesMut {
        let body = self.extras.len() + self.key.len() + self.value.len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body);
        buf.put_u8(REQ_MAGIC);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key.len() as u16);
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(self.datatype);
        buf.put_u16(self.vbucket);
        buf.put_u32(body as u32);
        buf.put_u32(opaque);
        buf.put_u64(0);
        buf.put_slice(&self.extras);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub datatype: u8,
    pub status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    pub fn parse(raw: &[u8; HEADER_LEN]) -> CbResult<Self> {
        let mut b = &raw[..];
        let magic = b.get_u8();
        if magic != RES_MAGIC {
            return Err(CbError::Protocol(format!("unexpected magic 0x{:02x}", magic)));
        }
        Ok(Self {
            opcode: b.get_u8(),
            key_len: b.get_u16(),
            extras_len: b.get_u8(),
            datatype: b.get_u8(),
            status: b.get_u16(),
            body_len: b.get_u32(),
            opaque: b.get_u32(),
            cas: b.get_u64(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub header: Header,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Response {
    pub fn decode(header: Header, mut body: Bytes) -> CbResult<Self> {
        let ext = header.extras_len as usize;
        let key = header.key_len as usize;
        if ext + key > body.len() {
            return Err(CbError::Protocol("body shorter than extras and key".into()));
        }
        let extras = body.split_to(ext);
        let key = body.split_to(key);
        Ok(Self {
            header,
            extras,
            key,
            value: body,
        })
    }

    pub fn status(&self) -> u16 {
        self.header.status
    }

    /// Map a non-success status to an error naming `what`.
    pub fn check(&self, what: &str) -> CbResult<()> {
        match self.status() {
            status::SUCCESS => Ok(()),
            status::KEY_NOT_FOUND => Err(CbError::DocumentNotFound(what.to_string())),
            status::KEY_EXISTS => Err(CbError::AlreadyExists(what.to_string())),
            status::TEMP_FAIL | status::BUSY | status::NOT_MY_VBUCKET => {
                Err(CbError::Transient(format!("{}: status 0x{:02x}", what, self.status())))
            }
            status::AUTH_ERROR => Err(CbError::ClusterInit(format!("{}: authentication failed", what))),
            status::NO_BUCKET => Err(CbError::NotFound(format!("bucket for {}", what))),
            status::UNKNOWN_COLLECTION => Err(CbError::NotFound(format!("collection for {}", what))),
            s => Err(CbError::Couchbase {
                code: s as u32,
                message: format!("{}: {}", what, String::from_utf8_lossy(&self.value)),
            }),
        }
    }
}

/// Unsigned LEB128, as used for collection-id key prefixes.
pub fn leb128(mut n: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

pub fn collection_key(cid: u32, key: &str) -> Vec<u8> {
    let mut out = leb128(cid);
    out.extend_from_slice(key.as_bytes());
    out
}

pub fn vbucket_for(key: &[u8], num_vbuckets: usize) -> u16 {
    if num_vbuckets == 0 {
        return 0;
    }
    let crc = crc32fast::hash(key);
    (((crc >> 16) & 0x7fff) as usize % num_vbuckets) as u16
}

fn subdoc_extras(path: &str, flags: u8) -> Vec<u8> {
    let mut e = Vec::with_capacity(3);
    e.extend_from_slice(&(path.len() as u16).to_be_bytes());
    e.push(flags);
    e
}

// =============================================================================
// TLS without certificate verification
// =============================================================================

#[derive(Debug)]
struct NoVerify(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn tls_connector() -> CbResult<tokio_rustls::TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| CbError::ClusterInit(format!("TLS configuration: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify(provider)))
        .with_no_client_auth();
    Ok(tokio_rustls::TlsConnector::from(Arc::new(config)))
}

// =============================================================================
// Connection
// =============================================================================

trait KvStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> KvStream for T {}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

pub struct KvConnection {
    stream: Box<dyn KvStream>,
    endpoint: String,
    opaque: u32,
    timeout: Duration,
}

impl std::fmt::Debug for KvConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvConnection").field("endpoint", &self.endpoint).finish()
    }
}

impl KvConnection {
    /// Connect, negotiate features, authenticate and select `bucket`.
    pub async fn connect(
        host: &str,
        port: u16,
        tls: bool,
        creds: &Credentials,
        bucket: Option<&str>,
        timeout: Duration,
    ) -> CbResult<Self> {
        let endpoint = super::rest::host_port(host, port);
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| CbError::Timeout(format!("connect {}", endpoint)))?
            .map_err(|e| CbError::NodeUnreachable(format!("{}: {}", endpoint, e)))?;
        tcp.set_nodelay(true)?;

        let stream: Box<dyn KvStream> = if tls {
            let name = ServerName::try_from(host.to_string())
                .map_err(|e| CbError::ClusterInit(format!("invalid server name {}: {}", host, e)))?;
            let s = tls_connector()?
                .connect(name, tcp)
                .await
                .map_err(|e| CbError::NodeUnreachable(format!("TLS handshake with {}: {}", endpoint, e)))?;
            Box::new(s)
        } else {
            Box::new(tcp)
        };

        let mut conn = Self {
            stream,
            endpoint,
            opaque: 0,
            timeout,
        };
        conn.hello().await?;
        conn.authenticate(creds).await?;
        if let Some(b) = bucket {
            conn.select_bucket(b).await?;
        }
        debug!("kv connection to {} ready", conn.endpoint);
        Ok(conn)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn call(&mut self, req: &Request) -> CbResult<Response> {
        self.opaque = self.opaque.wrapping_add(1);
        let opaque = self.opaque;
        let frame = req.encode(opaque);
        let endpoint = self.endpoint.clone();
        tokio::time::timeout(self.timeout, async {
            self.stream.write_all(&frame).await?;
            self.stream.flush().await?;
            loop {
                let mut raw = [0u8; HEADER_LEN];
                self.stream.read_exact(&mut raw).await?;
                let header = Header::parse(&raw)?;
                let mut body = vec![0u8; header.body_len as usize];
                self.stream.read_exact(&mut body).await?;
                if header.opaque != opaque {
                    trace!("skipping frame with opaque {} on {}", header.opaque, endpoint);
                    continue;
                }
                return Response::decode(header, Bytes::from(body));
            }
        })
        .await
        .map_err(|_| CbError::Timeout(format!("kv request 0x{:02x} to {}", req.opcode, self.endpoint)))?
    }

    async fn hello(&mut self) -> CbResult<()> {
        let mut req = Request::new(opcode::HELLO);
        req.key = KV_CLIENT_NAME.as_bytes().to_vec();
        for f in [feature::XERROR, feature::SELECT_BUCKET, feature::JSON, feature::COLLECTIONS] {
            req.value.extend_from_slice(&f.to_be_bytes());
        }
        self.call(&req).await?.check("HELLO")
    }

    async fn authenticate(&mut self, creds: &Credentials) -> CbResult<()> {
        let mut req = Request::new(opcode::SASL_AUTH);
        req.key = b"PLAIN".to_vec();
        req.value = format!("\0{}\0{}", creds.username, creds.password).into_bytes();
        self.call(&req).await?.check("SASL PLAIN")
    }

    async fn select_bucket(&mut self, bucket: &str) -> CbResult<()> {
        let mut req = Request::new(opcode::SELECT_BUCKET);
        req.key = bucket.as_bytes().to_vec();
        self.call(&req).await?.check(bucket)
    }

    pub async fn noop(&mut self) -> CbResult<()> {
        self.call(&Request::new(opcode::NOOP)).await?.check("NOOP")
    }
}

// =============================================================================
// Router
// =============================================================================

/// Parsed `vBucketServerMap` from a bucket configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbucketMap {
    pub servers: Vec<(String, u16)>,
    /// Active server index per vBucket, -1 when unassigned
    pub active: Vec<i32>,
}

impl VbucketMap {
    pub fn parse(config: &Value) -> CbResult<Self> {
        let map = config
            .get("vBucketServerMap")
            .ok_or_else(|| CbError::Protocol("bucket config has no vBucketServerMap".into()))?;
        let servers = map
            .get("serverList")
            .and_then(Value::as_array)
            .ok_or_else(|| CbError::Protocol("vBucketServerMap has no serverList".into()))?
            .iter()
            .filter_map(Value::as_str)
            .map(split_host_port)
            .collect::<CbResult<Vec<_>>>()?;
        let active = map
            .get("vBucketMap")
            .and_then(Value::as_array)
            .ok_or_else(|| CbError::Protocol("vBucketServerMap has no vBucketMap".into()))?
            .iter()
            .map(|chain| chain.get(0).and_then(Value::as_i64).unwrap_or(-1) as i32)
            .collect();
        Ok(Self { servers, active })
    }

    pub fn server_for(&self, vb: u16) -> Option<usize> {
        self.active
            .get(vb as usize)
            .and_then(|&i| usize::try_from(i).ok())
            .filter(|&i| i < self.servers.len())
    }
}

fn split_host_port(s: &str) -> CbResult<(String, u16)> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| CbError::Protocol(format!("server entry '{}' has no port", s)))?;
    let port = port
        .parse()
        .map_err(|_| CbError::Protocol(format!("server entry '{}' has a bad port", s)))?;
    Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
}

/// Routes keyed operations of one bucket to the owning data node.
#[derive(Debug)]
pub struct BucketRouter {
    bucket: String,
    map: RwLock<VbucketMap>,
    /// Dial address per server in `map.servers` order
    dial: Vec<(String, u16)>,
    conns: Vec<tokio::sync::Mutex<Option<KvConnection>>>,
    collection_ids: Mutex<HashMap<String, u32>>,
    creds: Credentials,
    tls: bool,
    timeout: Duration,
}

impl BucketRouter {
    /// `dial` maps a server list entry to the address actually dialed
    /// (TLS port, external hostname).
    pub fn new(
        bucket: &str,
        map: VbucketMap,
        dial: impl Fn(&str, u16) -> (String, u16),
        creds: Credentials,
        tls: bool,
        timeout: Duration,
    ) -> Self {
        let dial: Vec<(String, u16)> = map.servers.iter().map(|(h, p)| dial(h, *p)).collect();
        let conns = dial.iter().map(|_| tokio::sync::Mutex::new(None)).collect();
        Self {
            bucket: bucket.to_string(),
            map: RwLock::new(map),
            dial,
            conns,
            collection_ids: Mutex::new(HashMap::new()),
            creds,
            tls,
            timeout,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn call_on(&self, server: usize, req: &Request) -> CbResult<Response> {
        let (host, port) = self
            .dial
            .get(server)
            .ok_or_else(|| CbError::Protocol(format!("no server at index {}", server)))?;
        let mut slot = self.conns[server].lock().await;
        if slot.is_none() {
            *slot = Some(
                KvConnection::connect(host, *port, self.tls, &self.creds, Some(&self.bucket), self.timeout).await?,
            );
        }
        let Some(conn) = slot.as_mut() else {
            return Err(CbError::NodeUnreachable(format!("{}:{}", host, port)));
        };
        match conn.call(req).await {
            Ok(r) => Ok(r),
            Err(e) => {
                // The stream may be mid-frame; reconnect next time.
                *slot = None;
                Err(e)
            }
        }
    }

    async fn collection_id(&self, ks: &Keyspace) -> CbResult<u32> {
        if ks.is_default_scope() && ks.is_default_collection() {
            return Ok(0);
        }
        let path = ks.collection_path();
        if let Some(id) = self.collection_ids.lock().get(&path) {
            return Ok(*id);
        }
        let mut req = Request::new(opcode::GET_COLLECTION_ID);
        req.value = path.clone().into_bytes();
        let resp = self.call_on(0, &req).await?;
        resp.check(&ks.to_string())?;
        if resp.extras.len() < 12 {
            return Err(CbError::Protocol("short GET_COLLECTION_ID extras".into()));
        }
        let mut ext = &resp.extras[8..12];
        let id = ext.get_u32();
        self.collection_ids.lock().insert(path, id);
        Ok(id)
    }

    /// Send a keyed request to the active node, refreshing the map once on
    /// NOT_MY_VBUCKET and dropping the cached collection id when unknown.
    async fn keyed(&self, ks: &Keyspace, key: &str, mut req: Request) -> CbResult<Response> {
        let cid = self.collection_id(ks).await?;
        req.key = collection_key(cid, key);
        for attempt in 0..2 {
            let (vb, server) = {
                let map = self.map.read();
                let vb = vbucket_for(key.as_bytes(), map.active.len());
                (vb, map.server_for(vb))
            };
            let server = server.ok_or_else(|| CbError::Transient(format!("vBucket {} has no active node", vb)))?;
            req.vbucket = vb;
            let resp = self.call_on(server, &req).await?;
            match resp.status() {
                status::NOT_MY_VBUCKET if attempt == 0 => {
                    if let Ok(cfg) = serde_json::from_slice::<Value>(&resp.value) {
                        if let Ok(fresh) = VbucketMap::parse(&cfg) {
                            if fresh.servers.len() == self.dial.len() {
                                *self.map.write() = fresh;
                            }
                        }
                    }
                    continue;
                }
                status::UNKNOWN_COLLECTION => {
                    self.collection_ids.lock().remove(&ks.collection_path());
                    return Ok(resp);
                }
                _ => return Ok(resp),
            }
        }
        Err(CbError::Transient(format!("{}: vBucket map is stale", key)))
    }

    pub async fn get(&self, ks: &Keyspace, key: &str) -> CbResult<Option<Value>> {
        let resp = self.keyed(ks, key, Request::new(opcode::GET)).await?;
        if resp.status() == status::KEY_NOT_FOUND {
            return Ok(None);
        }
        resp.check(key)?;
        Ok(Some(serde_json::from_slice(&resp.value)?))
    }

    pub async fn upsert(&self, ks: &Keyspace, key: &str, doc: &Value) -> CbResult<()> {
        let mut req = Request::new(opcode::SET);
        req.datatype = DATATYPE_JSON;
        req.extras.extend_from_slice(&JSON_FLAGS.to_be_bytes());
        req.extras.extend_from_slice(&0u32.to_be_bytes());
        req.value = serde_json::to_vec(doc)?;
        self.keyed(ks, key, req).await?.check(key)
    }

    pub async fn remove(&self, ks: &Keyspace, key: &str) -> CbResult<bool> {
        let resp = self.keyed(ks, key, Request::new(opcode::DELETE)).await?;
        if resp.status() == status::KEY_NOT_FOUND {
            return Ok(false);
        }
        resp.check(key)?;
        Ok(true)
    }

    pub async fn subdoc_get(&self, ks: &Keyspace, key: &str, path: &str) -> CbResult<Option<Value>> {
        let mut req = Request::new(opcode::SUBDOC_GET);
        req.extras = subdoc_extras(path, 0);
        req.value = path.as_bytes().to_vec();
        let resp = self.keyed(ks, key, req).await?;
        match resp.status() {
            status::KEY_NOT_FOUND | status::SUBDOC_PATH_NOT_FOUND => Ok(None),
            _ => {
                resp.check(key)?;
                Ok(Some(serde_json::from_slice(&resp.value)?))
            }
        }
    }

    pub async fn subdoc_upsert(&self, ks: &Keyspace, key: &str, path: &str, value: &Value) -> CbResult<()> {
        let mut req = Request::new(opcode::SUBDOC_DICT_UPSERT);
        req.extras = subdoc_extras(path, SUBDOC_FLAG_MKDIR_P);
        req.value = path.as_bytes().to_vec();
        req.value.extend_from_slice(&serde_json::to_vec(value)?);
        self.keyed(ks, key, req).await?.check(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_layout() {
        let mut req = Request::new(opcode::SET);
        req.vbucket = 513;
        req.extras = vec![0; 8];
        req.key = b"k1".to_vec();
        req.value = b"{}".to_vec();
        let buf = req.encode(7);
        assert_eq!(buf.len(), HEADER_LEN + 12);
        assert_eq!(buf[0], REQ_MAGIC);
        assert_eq!(buf[1], opcode::SET);
        assert_eq!(&buf[2..4], &[0, 2]);
        assert_eq!(buf[4], 8);
        assert_eq!(&buf[6..8], &513u16.to_be_bytes());
        assert_eq!(&buf[8..12], &12u32.to_be_bytes());
        assert_eq!(&buf[12..16], &7u32.to_be_bytes());
        assert_eq!(&buf[HEADER_LEN + 8..HEADER_LEN + 10], b"k1");
    }

    #[test]
    fn test_response_decode_and_status() {
        let mut raw = [0u8; HEADER_LEN];
        raw[0] = RES_MAGIC;
        raw[1] = opcode::GET;
        raw[4] = 4; // extras
        raw[6..8].copy_from_slice(&status::KEY_NOT_FOUND.to_be_bytes());
        raw[8..12].copy_from_slice(&6u32.to_be_bytes());
        let header = Header::parse(&raw).unwrap();
        let resp = Response::decode(header, Bytes::from_static(&[0, 0, 0, 0, b'n', b'o'])).unwrap();
        assert_eq!(resp.extras.len(), 4);
        assert_eq!(&resp.value[..], b"no");
        assert!(matches!(resp.check("k"), Err(CbError::DocumentNotFound(_))));

        raw[0] = 0x42;
        assert!(Header::parse(&raw).is_err());
    }

    #[test]
    fn test_leb128() {
        assert_eq!(leb128(0), vec![0x00]);
        assert_eq!(leb128(8), vec![0x08]);
        assert_eq!(leb128(127), vec![0x7f]);
        assert_eq!(leb128(128), vec![0x80, 0x01]);
        assert_eq!(leb128(300), vec![0xac, 0x02]);
        assert_eq!(collection_key(8, "a"), vec![0x08, b'a']);
    }

    #[test]
    fn test_vbucket_hash_in_range() {
        for i in 0..1000 {
            let key = format!("cbperf:{}", i);
            assert!(vbucket_for(key.as_bytes(), 1024) < 1024);
        }
        assert_eq!(vbucket_for(b"x", 0), 0);
        // stable across calls
        assert_eq!(vbucket_for(b"user_data:1", 64), vbucket_for(b"user_data:1", 64));
    }

    #[test]
    fn test_vbucket_map_parse() {
        let cfg = json!({"vBucketServerMap": {
            "serverList": ["10.0.0.1:11210", "10.0.0.2:11210"],
            "vBucketMap": [[0, 1], [1, 0], [-1, 0]]
        }});
        let map = VbucketMap::parse(&cfg).unwrap();
        assert_eq!(map.servers[1], ("10.0.0.2".to_string(), 11210));
        assert_eq!(map.server_for(0), Some(0));
        assert_eq!(map.server_for(1), Some(1));
        assert_eq!(map.server_for(2), None);
        assert!(VbucketMap::parse(&json!({})).is_err());
    }
}
