//! The authentication handshake, run once per connection between transport
//! establishment and the first user RPC.
//!
//! The server advertises its acceptable schemes via AUTH_LIST (an empty
//! list, or a server too old to know the call, means no authentication).
//! The caller may pin a scheme with the `auth=` URI parameter; otherwise
//! the server's first offer wins.

use async_trait::async_trait;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::proto::{
    self, AuthListRet, AuthSaslInitRet, AuthSaslStartArgs, AuthSaslStepArgs, AuthSaslStepRet,
};
use crate::sasl::{self, CredentialPrompt, CredentialProvider, StepResult};
use crate::uri::RemoteUri;

/// Stand-in provider when the caller supplied none: any prompt is a
/// failure.
struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn fill(&self, _prompts: &mut [CredentialPrompt]) -> Result<()> {
        Err(Error::Authentication(
            "no authentication callback available".into(),
        ))
    }
}

enum Scheme {
    Sasl { mech: Option<String> },
    Polkit,
}

fn parse_authtype(authtype: &str) -> Result<Scheme> {
    let lower = authtype.to_ascii_lowercase();
    if lower == "sasl" {
        Ok(Scheme::Sasl { mech: None })
    } else if let Some(mech) = lower.strip_prefix("sasl.") {
        Ok(Scheme::Sasl {
            mech: Some(authtype[authtype.len() - mech.len()..].to_string()),
        })
    } else if lower == "polkit" {
        Ok(Scheme::Polkit)
    } else {
        Err(Error::Authentication(format!(
            "unknown authentication type {authtype}"
        )))
    }
}

fn scheme_code(scheme: &Scheme) -> u32 {
    match scheme {
        Scheme::Sasl { .. } => proto::AUTH_SASL,
        Scheme::Polkit => proto::AUTH_POLKIT,
    }
}

pub(crate) async fn authenticate(
    conn: &Connection,
    uri: &RemoteUri,
    credentials: Option<&dyn CredentialProvider>,
) -> Result<()> {
    let offered: AuthListRet = match conn.call(proto::PROC_AUTH_LIST, &()).await {
        Ok(ret) => ret,
        // A server that predates AUTH_LIST performs no authentication.
        Err(Error::NotSupported(_)) => return Ok(()),
        Err(e) => return Err(e),
    };
    if offered.types.is_empty() {
        return Ok(());
    }

    let chosen = match uri.params.auth.as_deref() {
        Some(authtype) => {
            let scheme = parse_authtype(authtype)?;
            let code = scheme_code(&scheme);
            if !offered.types.contains(&code) {
                return Err(Error::Authentication(format!(
                    "requested authentication type {authtype} rejected"
                )));
            }
            match scheme {
                Scheme::Sasl { mech } => return auth_sasl(conn, mech.as_deref(), credentials).await,
                Scheme::Polkit => return auth_polkit(conn).await,
            }
        }
        None => offered.types[0],
    };

    match chosen {
        proto::AUTH_NONE => Ok(()),
        proto::AUTH_SASL => auth_sasl(conn, None, credentials).await,
        proto::AUTH_POLKIT => auth_polkit(conn).await,
        other => Err(Error::Authentication(format!(
            "unsupported authentication type {other}"
        ))),
    }
}

/// INIT fetches the server's mechanism list, START carries our initial
/// response, then STEP until both ends report completion. The client must
/// always take at least one local step so a lying server cannot skip
/// mutual verification.
async fn auth_sasl(
    conn: &Connection,
    pinned: Option<&str>,
    credentials: Option<&dyn CredentialProvider>,
) -> Result<()> {
    let provider: &dyn CredentialProvider = credentials.unwrap_or(&NoCredentials);

    let init: AuthSaslInitRet = conn.call(proto::PROC_AUTH_SASL_INIT, &()).await?;
    tracing::debug!(mechlist = %init.mechlist, "server offered SASL mechanisms");

    let mut mech = sasl::select_mechanism(&init.mechlist, pinned, conn.transport_secure())?;

    let first = mech.start(provider).await?;
    check_blob(&first)?;
    let mut client_done = first.complete;

    let sret: AuthSaslStepRet = conn
        .call(
            proto::PROC_AUTH_SASL_START,
            &AuthSaslStartArgs {
                mech: mech.name().to_string(),
                nil: first.data.is_none(),
                data: first.data.unwrap_or_default(),
            },
        )
        .await?;
    let mut server_done = sret.complete;
    let mut server_data = if sret.nil { None } else { Some(sret.data) };

    while !(client_done && server_done) {
        let out = mech.step(server_data.take().as_deref(), provider).await?;
        check_blob(&out)?;
        client_done = out.complete;
        if client_done && server_done {
            break;
        }

        let pret: AuthSaslStepRet = conn
            .call(
                proto::PROC_AUTH_SASL_STEP,
                &AuthSaslStepArgs {
                    nil: out.data.is_none(),
                    data: out.data.unwrap_or_default(),
                },
            )
            .await?;
        server_done = pret.complete;
        server_data = if pret.nil { None } else { Some(pret.data) };
    }

    // On an insecure transport the negotiated mechanism must bring its own
    // protection of sufficient strength.
    match mech.take_layer() {
        Some(layer) => {
            tracing::debug!(mechanism = mech.name(), "installing security layer");
            conn.install_layer(layer);
        }
        None if !conn.transport_secure() => {
            return Err(Error::Authentication(format!(
                "negotiated mechanism {} provides no protection layer on an insecure transport",
                mech.name()
            )));
        }
        None => {}
    }

    tracing::debug!(mechanism = mech.name(), "SASL authentication complete");
    Ok(())
}

fn check_blob(step: &StepResult) -> Result<()> {
    let len = step.data.as_ref().map(Vec::len).unwrap_or(0);
    if len > proto::AUTH_SASL_DATA_MAX {
        return Err(Error::Authentication(format!(
            "SASL negotiation data too long: {len} bytes"
        )));
    }
    Ok(())
}

/// Local peer-credential policy check: an empty-bodied call the server
/// answers after consulting its policy agent.
async fn auth_polkit(conn: &Connection) -> Result<()> {
    conn.call::<_, ()>(proto::PROC_AUTH_POLKIT, &()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authtype_parsing() {
        assert!(matches!(
            parse_authtype("sasl").unwrap(),
            Scheme::Sasl { mech: None }
        ));
        match parse_authtype("sasl.PLAIN").unwrap() {
            Scheme::Sasl { mech } => assert_eq!(mech.as_deref(), Some("PLAIN")),
            _ => panic!("wrong scheme"),
        }
        assert!(matches!(parse_authtype("polkit").unwrap(), Scheme::Polkit));
        assert!(parse_authtype("kerberos").is_err());
    }

    #[tokio::test]
    async fn missing_callback_is_an_authentication_error() {
        let mut prompts = [CredentialPrompt {
            kind: crate::sasl::CredentialKind::Username,
            prompt: "username".into(),
            response: None,
        }];
        let err = NoCredentials.fill(&mut prompts).await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }
}
