//! Challenge/response authentication: client-side mechanisms, the
//! credential callback they interrogate, and the optional record-level
//! security layer a negotiated mechanism may install on the byte stream.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Largest record a security layer will accept, matching the buffer size
/// advertised during negotiation.
pub const RECORD_MAX: usize = 100_000;

/// Minimum effective key bits a protection layer must negotiate when the
/// underlying transport is not already secure.
pub const MIN_STRENGTH_BITS: u32 = 56;

/// Record-level transform wrapping the transport after authentication.
///
/// Encoding may buffer: one write from above yields zero or more complete
/// wire records. Decoding consumes raw wire bytes and yields plaintext once
/// a full record is present; partially consumed plaintext is the caller's
/// to track, and the caller must drain decoded data before polling the
/// socket again (the socket may stay quiet while plaintext is pending).
pub trait SecurityLayer: Send {
    fn encode(&mut self, plain: &[u8]) -> Result<Vec<u8>>;
    fn decode(&mut self, wire: &mut BytesMut) -> Result<Option<Bytes>>;
}

/// Prefix a payload with the 4-byte big-endian record length.
pub fn frame_record(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Split one complete record off the front of `wire`, if present.
pub fn take_record(wire: &mut BytesMut) -> Result<Option<Bytes>> {
    if wire.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
    if len > RECORD_MAX {
        return Err(Error::Protocol(format!(
            "security layer record of {len} bytes exceeds limit"
        )));
    }
    if wire.len() < 4 + len {
        return Ok(None);
    }
    wire.advance(4);
    Ok(Some(wire.split_to(len).freeze()))
}

/// What a mechanism needs from the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Username,
    Password,
    Realm,
}

#[derive(Debug, Clone)]
pub struct CredentialPrompt {
    pub kind: CredentialKind,
    pub prompt: String,
    pub response: Option<String>,
}

impl CredentialPrompt {
    fn new(kind: CredentialKind, prompt: &str) -> Self {
        CredentialPrompt {
            kind,
            prompt: prompt.to_string(),
            response: None,
        }
    }
}

/// Caller-supplied source of credentials, consulted whenever a mechanism
/// step needs user input.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn fill(&self, prompts: &mut [CredentialPrompt]) -> Result<()>;
}

/// Fixed credentials known up front.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub realm: Option<String>,
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn fill(&self, prompts: &mut [CredentialPrompt]) -> Result<()> {
        for prompt in prompts {
            prompt.response = match prompt.kind {
                CredentialKind::Username => self.username.clone(),
                CredentialKind::Password => self.password.clone(),
                CredentialKind::Realm => self.realm.clone(),
            };
            if prompt.response.is_none() {
                return Err(Error::Authentication(format!(
                    "no credential available for '{}'",
                    prompt.prompt
                )));
            }
        }
        Ok(())
    }
}

/// Output of one client-side negotiation step.
#[derive(Debug)]
pub struct StepResult {
    /// Bytes for the server; `None` is distinct from `Some(empty)`.
    pub data: Option<Vec<u8>>,
    /// The client side considers the exchange finished.
    pub complete: bool,
}

/// One client-side mechanism. `start` produces the initial response;
/// `step` consumes each server challenge. A layered mechanism hands over
/// its `SecurityLayer` once both sides report completion.
#[async_trait]
pub trait SaslMechanism: Send {
    fn name(&self) -> &'static str;

    /// Effective key bits of the protection layer this mechanism can
    /// negotiate; zero for authentication-only mechanisms.
    fn max_strength(&self) -> u32;

    /// Sends secrets in the clear, or authenticates nobody. Refused on
    /// transports that are not already secure.
    fn is_weak(&self) -> bool;

    async fn start(&mut self, creds: &dyn CredentialProvider) -> Result<StepResult>;

    async fn step(
        &mut self,
        server: Option<&[u8]>,
        creds: &dyn CredentialProvider,
    ) -> Result<StepResult>;

    fn take_layer(&mut self) -> Option<Box<dyn SecurityLayer>> {
        None
    }
}

impl std::fmt::Debug for dyn SaslMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslMechanism").field("name", &self.name()).finish()
    }
}

/// Pick a mechanism from the server's offer, honouring a pinned name and
/// the transport-security policy.
pub fn select_mechanism(
    offered: &str,
    pinned: Option<&str>,
    transport_secure: bool,
) -> Result<Box<dyn SaslMechanism>> {
    let offered: Vec<&str> = offered.split_whitespace().collect();

    if let Some(want) = pinned {
        if !offered.iter().any(|m| m.eq_ignore_ascii_case(want)) {
            return Err(Error::Authentication(format!(
                "mechanism {want} not supported by server"
            )));
        }
        let mech = instantiate(want).ok_or_else(|| {
            Error::Authentication(format!("mechanism {want} not supported by this client"))
        })?;
        return check_policy(mech, transport_secure);
    }

    for name in &offered {
        if let Some(mech) = instantiate(name) {
            if policy_allows(&*mech, transport_secure) {
                return Ok(mech);
            }
        }
    }

    Err(Error::Authentication(format!(
        "no mutually supported mechanism of sufficient strength (server offered: {})",
        offered.join(" ")
    )))
}

fn policy_allows(mech: &dyn SaslMechanism, transport_secure: bool) -> bool {
    if transport_secure {
        return true;
    }
    !mech.is_weak() && mech.max_strength() >= MIN_STRENGTH_BITS
}

fn check_policy(
    mech: Box<dyn SaslMechanism>,
    transport_secure: bool,
) -> Result<Box<dyn SaslMechanism>> {
    if policy_allows(&*mech, transport_secure) {
        Ok(mech)
    } else {
        Err(Error::Authentication(format!(
            "mechanism {} is not usable on an insecure transport",
            mech.name()
        )))
    }
}

fn instantiate(name: &str) -> Option<Box<dyn SaslMechanism>> {
    if name.eq_ignore_ascii_case("PLAIN") {
        Some(Box::new(Plain))
    } else if name.eq_ignore_ascii_case("ANONYMOUS") {
        Some(Box::new(Anonymous))
    } else {
        None
    }
}

/// RFC 4616: `authzid NUL authcid NUL passwd`, complete after the initial
/// response.
struct Plain;

#[async_trait]
impl SaslMechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn max_strength(&self) -> u32 {
        0
    }

    fn is_weak(&self) -> bool {
        true
    }

    async fn start(&mut self, creds: &dyn CredentialProvider) -> Result<StepResult> {
        let mut prompts = [
            CredentialPrompt::new(CredentialKind::Username, "username"),
            CredentialPrompt::new(CredentialKind::Password, "password"),
        ];
        creds.fill(&mut prompts).await?;
        let username = prompts[0].response.take().unwrap_or_default();
        let password = prompts[1].response.take().unwrap_or_default();

        let mut data = Vec::with_capacity(username.len() + password.len() + 2);
        data.push(0);
        data.extend_from_slice(username.as_bytes());
        data.push(0);
        data.extend_from_slice(password.as_bytes());

        Ok(StepResult {
            data: Some(data),
            complete: true,
        })
    }

    async fn step(
        &mut self,
        _server: Option<&[u8]>,
        _creds: &dyn CredentialProvider,
    ) -> Result<StepResult> {
        Ok(StepResult {
            data: None,
            complete: true,
        })
    }
}

/// RFC 4505: a trace string, no verification of anyone.
struct Anonymous;

#[async_trait]
impl SaslMechanism for Anonymous {
    fn name(&self) -> &'static str {
        "ANONYMOUS"
    }

    fn max_strength(&self) -> u32 {
        0
    }

    fn is_weak(&self) -> bool {
        true
    }

    async fn start(&mut self, _creds: &dyn CredentialProvider) -> Result<StepResult> {
        Ok(StepResult {
            data: Some(b"anonymous".to_vec()),
            complete: true,
        })
    }

    async fn step(
        &mut self,
        _server: Option<&[u8]>,
        _creds: &dyn CredentialProvider,
    ) -> Result<StepResult> {
        Ok(StepResult {
            data: None,
            complete: true,
        })
    }
}
