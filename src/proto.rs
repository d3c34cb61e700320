//! Protocol constants and the handful of typed payloads the core itself
//! needs (open/close, version probe, authentication, event registration,
//! volume transfer). The hundreds of remaining procedure wrappers are
//! generated from the schema and sit outside this crate.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::xdr::{self, XdrDecode, XdrEncode};

/// Program identifier carried in every header.
pub const PROGRAM: u32 = 0x2000_8086;
/// Protocol revision; all versioning happens at the RPC layer.
pub const PROTOCOL_VERSION: u32 = 1;

pub const PROC_OPEN: u32 = 1;
pub const PROC_CLOSE: u32 = 2;
pub const PROC_GET_VERSION: u32 = 4;
pub const PROC_LIST_DOMAINS: u32 = 38;
pub const PROC_GET_URI: u32 = 59;
pub const PROC_AUTH_LIST: u32 = 66;
pub const PROC_AUTH_SASL_INIT: u32 = 67;
pub const PROC_AUTH_SASL_START: u32 = 68;
pub const PROC_AUTH_SASL_STEP: u32 = 69;
pub const PROC_AUTH_POLKIT: u32 = 70;
pub const PROC_DOMAIN_EVENTS_REGISTER_ANY: u32 = 105;
pub const PROC_DOMAIN_EVENTS_DEREGISTER_ANY: u32 = 106;
pub const PROC_DOMAIN_EVENT_LIFECYCLE: u32 = 107;
pub const PROC_DOMAIN_EVENT_REBOOT: u32 = 108;
pub const PROC_DOMAIN_EVENT_RTC_CHANGE: u32 = 109;
pub const PROC_DOMAIN_EVENT_WATCHDOG: u32 = 110;
pub const PROC_STORAGE_VOL_UPLOAD: u32 = 208;
pub const PROC_STORAGE_VOL_DOWNLOAD: u32 = 209;

/// Authentication schemes a server may offer.
pub const AUTH_NONE: u32 = 0;
pub const AUTH_SASL: u32 = 1;
pub const AUTH_POLKIT: u32 = 2;

/// Upper bound on one SASL negotiation blob.
pub const AUTH_SASL_DATA_MAX: usize = 65536;

/// Most domain ids a list reply may carry.
pub const DOMAIN_LIST_MAX: usize = 16384;

const UUID_LEN: usize = 16;

// Error classification used by the quiet-missing-RPC translation.
const ERR_CODE_RPC: i32 = 38;
const ERR_LEVEL_ERROR: i32 = 2;

/// Error record carried in an ERROR-status reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireError {
    pub code: i32,
    pub domain: i32,
    pub message: Option<String>,
    pub level: i32,
}

impl WireError {
    /// True for the reply an old server sends when asked for a procedure it
    /// does not know about.
    pub fn is_unknown_procedure(&self) -> bool {
        self.code == ERR_CODE_RPC
            && self.level == ERR_LEVEL_ERROR
            && self
                .message
                .as_deref()
                .is_some_and(|m| m.starts_with("unknown procedure"))
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{msg} (code {}, domain {})", self.code, self.domain),
            None => write!(f, "code {}, domain {}", self.code, self.domain),
        }
    }
}

impl XdrDecode for WireError {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let code = xdr::get_i32(buf)?;
        let domain = xdr::get_i32(buf)?;
        let message = xdr::get_string_opt(buf)?;
        let level = xdr::get_i32(buf)?;
        // Trailing domain-object references and auxiliary strings are not
        // interesting to the client; whatever follows is dropped with the
        // buffer.
        Ok(WireError {
            code,
            domain,
            message,
            level,
        })
    }
}

/// On-wire reference to a domain: name, raw UUID, numeric id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRef {
    pub name: String,
    pub uuid: [u8; 16],
    pub id: i32,
}

impl XdrDecode for DomainRef {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let name = xdr::get_string(buf)?;
        if buf.len() < UUID_LEN {
            return Err(Error::Protocol("payload truncated reading uuid".into()));
        }
        let mut uuid = [0u8; UUID_LEN];
        uuid.copy_from_slice(&buf.split_to(UUID_LEN));
        let id = xdr::get_i32(buf)?;
        Ok(DomainRef { name, uuid, id })
    }
}

impl XdrEncode for DomainRef {
    fn encode(&self, buf: &mut BytesMut) {
        xdr::put_string(buf, &self.name);
        buf.extend_from_slice(&self.uuid);
        xdr::put_i32(buf, self.id);
    }
}

pub struct OpenArgs {
    pub name: Option<String>,
    pub flags: u32,
}

impl XdrEncode for OpenArgs {
    fn encode(&self, buf: &mut BytesMut) {
        xdr::put_string_opt(buf, self.name.as_deref());
        xdr::put_u32(buf, self.flags);
    }
}

pub struct GetVersionRet {
    /// Packed as major * 1_000_000 + minor * 1_000 + micro.
    pub version: u64,
}

impl GetVersionRet {
    pub fn parts(&self) -> (u64, u64, u64) {
        (
            self.version / 1_000_000,
            self.version % 1_000_000 / 1_000,
            self.version % 1_000,
        )
    }
}

impl XdrDecode for GetVersionRet {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(GetVersionRet {
            version: xdr::get_u64(buf)?,
        })
    }
}

pub struct GetUriRet {
    pub uri: String,
}

impl XdrDecode for GetUriRet {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(GetUriRet {
            uri: xdr::get_string(buf)?,
        })
    }
}

pub struct ListDomainsArgs {
    pub maxids: i32,
}

impl XdrEncode for ListDomainsArgs {
    fn encode(&self, buf: &mut BytesMut) {
        xdr::put_i32(buf, self.maxids);
    }
}

pub struct ListDomainsRet {
    pub ids: Vec<u32>,
}

impl XdrDecode for ListDomainsRet {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(ListDomainsRet {
            ids: xdr::get_u32_array(buf, DOMAIN_LIST_MAX)?,
        })
    }
}

pub struct AuthListRet {
    pub types: Vec<u32>,
}

impl XdrDecode for AuthListRet {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(AuthListRet {
            types: xdr::get_u32_array(buf, 16)?,
        })
    }
}

pub struct AuthSaslInitRet {
    /// Space-separated mechanism names offered by the server.
    pub mechlist: String,
}

impl XdrDecode for AuthSaslInitRet {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(AuthSaslInitRet {
            mechlist: xdr::get_string(buf)?,
        })
    }
}

/// SASL distinguishes "no data" from "empty data"; `nil` carries that bit.
pub struct AuthSaslStartArgs {
    pub mech: String,
    pub nil: bool,
    pub data: Vec<u8>,
}

impl XdrEncode for AuthSaslStartArgs {
    fn encode(&self, buf: &mut BytesMut) {
        xdr::put_string(buf, &self.mech);
        xdr::put_bool(buf, self.nil);
        xdr::put_opaque(buf, &self.data);
    }
}

pub struct AuthSaslStepArgs {
    pub nil: bool,
    pub data: Vec<u8>,
}

impl XdrEncode for AuthSaslStepArgs {
    fn encode(&self, buf: &mut BytesMut) {
        xdr::put_bool(buf, self.nil);
        xdr::put_opaque(buf, &self.data);
    }
}

pub struct AuthSaslStepRet {
    pub complete: bool,
    pub nil: bool,
    pub data: Vec<u8>,
}

impl XdrDecode for AuthSaslStepRet {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(AuthSaslStepRet {
            complete: xdr::get_bool(buf)?,
            nil: xdr::get_bool(buf)?,
            data: xdr::get_opaque(buf)?,
        })
    }
}

pub struct EventsRegisterAnyArgs {
    pub event_id: i32,
}

impl XdrEncode for EventsRegisterAnyArgs {
    fn encode(&self, buf: &mut BytesMut) {
        xdr::put_i32(buf, self.event_id);
    }
}

/// On-wire reference to a storage volume.
#[derive(Debug, Clone)]
pub struct VolumeRef {
    pub pool: String,
    pub name: String,
    pub key: String,
}

impl XdrEncode for VolumeRef {
    fn encode(&self, buf: &mut BytesMut) {
        xdr::put_string(buf, &self.pool);
        xdr::put_string(buf, &self.name);
        xdr::put_string(buf, &self.key);
    }
}

pub struct VolTransferArgs {
    pub vol: VolumeRef,
    pub offset: u64,
    pub length: u64,
    pub flags: u32,
}

impl XdrEncode for VolTransferArgs {
    fn encode(&self, buf: &mut BytesMut) {
        self.vol.encode(buf);
        xdr::put_u64(buf, self.offset);
        xdr::put_u64(buf, self.length);
        xdr::put_u32(buf, self.flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_wire_error(err: &WireError) -> Bytes {
        let mut buf = BytesMut::new();
        xdr::put_i32(&mut buf, err.code);
        xdr::put_i32(&mut buf, err.domain);
        xdr::put_string_opt(&mut buf, err.message.as_deref());
        xdr::put_i32(&mut buf, err.level);
        buf.freeze()
    }

    #[test]
    fn wire_error_roundtrip() {
        let err = WireError {
            code: 9,
            domain: 10,
            message: Some("operation failed: domain is already running".into()),
            level: 2,
        };
        let mut rd = encode_wire_error(&err);
        assert_eq!(WireError::decode(&mut rd).unwrap(), err);
    }

    #[test]
    fn unknown_procedure_detection() {
        let err = WireError {
            code: ERR_CODE_RPC,
            domain: 13,
            message: Some("unknown procedure: 209".into()),
            level: ERR_LEVEL_ERROR,
        };
        assert!(err.is_unknown_procedure());

        let other = WireError {
            code: ERR_CODE_RPC,
            domain: 13,
            message: Some("marshalling failed".into()),
            level: ERR_LEVEL_ERROR,
        };
        assert!(!other.is_unknown_procedure());
    }

    #[test]
    fn version_parts() {
        let ret = GetVersionRet { version: 8_002_001 };
        assert_eq!(ret.parts(), (8, 2, 1));
    }

    #[test]
    fn domain_ref_roundtrip() {
        let dom = DomainRef {
            name: "guest-7".into(),
            uuid: *b"\x01\x02\x03\x04\x05\x06\x07\x08\x09\x0a\x0b\x0c\x0d\x0e\x0f\x10",
            id: 7,
        };
        let mut buf = BytesMut::new();
        dom.encode(&mut buf);
        let mut rd = buf.freeze();
        assert_eq!(DomainRef::decode(&mut rd).unwrap(), dom);
    }
}
