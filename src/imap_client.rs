//! Production [`MailSession`] on top of the `imap` crate over native TLS.

use std::net::TcpStream;

use chrono::Utc;
use imap::types::Fetch;
use imap_proto::types::{BodyContentCommon, BodyStructure};
use native_tls::{TlsConnector, TlsStream};

use crate::connector::{ConnectError, Dialer};
use crate::message::{Address, BodyPart, Envelope, RawMessage};
use crate::session::{
    format_sequence_set, FlagOp, IdKind, MailSession, MailboxInfo, SearchCriteria,
    SelectedMailbox, SessionError,
};

/// Items requested for every message. RFC822.HEADER does not set `\Seen`.
const FETCH_QUERY: &str = "(UID FLAGS ENVELOPE RFC822.SIZE INTERNALDATE BODYSTRUCTURE RFC822.HEADER)";

#[derive(Debug, Clone, Copy, Default)]
pub struct TlsDialer;

impl Dialer for TlsDialer {
    fn dial(
        &self,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn MailSession>, ConnectError> {
        let tls = TlsConnector::builder().build().map_err(|e| ConnectError::Connect {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

        let client = imap::connect((host, port), host, &tls).map_err(|e| ConnectError::Connect {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
        log::debug!("Connected to {}:{}", host, port);

        let session = client
            .login(username, password)
            .map_err(|e| ConnectError::Auth {
                host: host.to_string(),
                reason: e.0.to_string(),
            })?;

        Ok(Box::new(ImapSession { inner: session }))
    }
}

pub struct ImapSession {
    inner: imap::Session<TlsStream<TcpStream>>,
}

fn command_error(command: &'static str, err: imap::Error) -> SessionError {
    let reason = err.to_string();
    let lowered = reason.to_lowercase();
    let stale = matches!(err, imap::Error::ConnectionLost | imap::Error::Io(_))
        || lowered.contains("not authenticated")
        || lowered.contains("not connected");
    if stale {
        SessionError::Stale(format!("{}: {}", command, reason))
    } else {
        SessionError::command(command, reason)
    }
}

impl MailSession for ImapSession {
    fn list(&mut self) -> Result<Vec<MailboxInfo>, SessionError> {
        let names = self
            .inner
            .list(Some(""), Some("*"))
            .map_err(|e| command_error("LIST", e))?;

        Ok(names
            .iter()
            .map(|name| MailboxInfo {
                name: name.name().to_string(),
                delimiter: name.delimiter().map(|d| d.to_string()),
                attributes: name.attributes().iter().map(|a| format!("{:?}", a)).collect(),
            })
            .collect())
    }

    fn select(&mut self, folder: &str, read_only: bool) -> Result<SelectedMailbox, SessionError> {
        let result = if read_only {
            self.inner.examine(folder)
        } else {
            self.inner.select(folder)
        };
        let mailbox = result.map_err(|e| match command_error("SELECT", e) {
            SessionError::Command { reason, .. } => SessionError::Select {
                folder: folder.to_string(),
                reason,
            },
            stale => stale,
        })?;

        Ok(SelectedMailbox {
            name: folder.to_string(),
            exists: mailbox.exists,
            read_only,
        })
    }

    fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<u32>, SessionError> {
        let found = self
            .inner
            .search(criteria.to_query())
            .map_err(|e| command_error("SEARCH", e))?;
        let mut seqs: Vec<u32> = found.into_iter().collect();
        seqs.sort_unstable();
        Ok(seqs)
    }

    fn fetch(&mut self, seqs: &[u32]) -> Result<Vec<RawMessage>, SessionError> {
        if seqs.is_empty() {
            return Ok(Vec::new());
        }
        let fetches = self
            .inner
            .fetch(format_sequence_set(seqs), FETCH_QUERY)
            .map_err(|e| command_error("FETCH", e))?;
        Ok(fetches.iter().map(to_raw_message).collect())
    }

    fn store(&mut self, seqs: &[u32], op: FlagOp, flags: &[&str]) -> Result<(), SessionError> {
        let query = format!("{} ({})", op.store_item(), flags.join(" "));
        self.inner
            .store(format_sequence_set(seqs), query)
            .map_err(|e| command_error("STORE", e))?;
        Ok(())
    }

    fn move_messages(&mut self, ids: &[u32], kind: IdKind, dest: &str) -> Result<(), SessionError> {
        let set = format_sequence_set(ids);
        match kind {
            IdKind::Seq => self.inner.mv(set, dest).map_err(|e| command_error("MOVE", e)),
            IdKind::Uid => self
                .inner
                .uid_mv(set, dest)
                .map_err(|e| command_error("UID MOVE", e)),
        }
    }

    fn expunge(&mut self) -> Result<usize, SessionError> {
        let expunged = self.inner.expunge().map_err(|e| command_error("EXPUNGE", e))?;
        Ok(expunged.len())
    }

    fn noop(&mut self) -> Result<(), SessionError> {
        self.inner.noop().map_err(|e| command_error("NOOP", e))
    }

    fn logout(&mut self) -> Result<(), SessionError> {
        self.inner.logout().map_err(|e| command_error("LOGOUT", e))
    }
}

/// Lossy text from whatever byte or string type the protocol layer hands out.
trait Lossy {
    fn lossy(&self) -> String;
}

impl Lossy for [u8] {
    fn lossy(&self) -> String {
        String::from_utf8_lossy(self).into_owned()
    }
}

impl Lossy for str {
    fn lossy(&self) -> String {
        self.to_string()
    }
}

fn to_raw_message(fetch: &Fetch) -> RawMessage {
    RawMessage {
        seq: fetch.message,
        uid: fetch.uid,
        flags: fetch.flags().iter().map(|f| f.to_string()).collect(),
        envelope: fetch.envelope().map(|envelope| Envelope {
            date: envelope.date.as_ref().map(|d| d.lossy()),
            subject: envelope.subject.as_ref().map(|s| s.lossy()),
            from: addresses(&envelope.from),
            sender: addresses(&envelope.sender),
            reply_to: addresses(&envelope.reply_to),
            to: addresses(&envelope.to),
            cc: addresses(&envelope.cc),
            message_id: envelope.message_id.as_ref().map(|m| m.lossy()),
        }),
        size: fetch.size,
        internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
        body_structure: fetch.bodystructure().map(to_body_part),
        header: fetch.header().map(|h| h.to_vec()),
    }
}

fn addresses(list: &Option<Vec<imap_proto::types::Address>>) -> Vec<Address> {
    list.iter()
        .flatten()
        .map(|a| Address {
            name: a.name.as_ref().map(|n| n.lossy()),
            mailbox: a.mailbox.as_ref().map(|m| m.lossy()),
            host: a.host.as_ref().map(|h| h.lossy()),
        })
        .collect()
}

fn to_body_part(structure: &BodyStructure) -> BodyPart {
    match structure {
        BodyStructure::Basic { common, .. } | BodyStructure::Text { common, .. } => {
            common_part(common)
        }
        BodyStructure::Message { common, body, .. } => {
            let mut part = common_part(common);
            part.children.push(to_body_part(body));
            part
        }
        BodyStructure::Multipart { common, bodies, .. } => {
            let mut part = common_part(common);
            part.children = bodies.iter().map(to_body_part).collect();
            part
        }
    }
}

fn common_part(common: &BodyContentCommon) -> BodyPart {
    let disposition = common.disposition.as_ref();
    BodyPart {
        mime_type: common.ty.ty.lossy(),
        mime_subtype: common.ty.subtype.lossy(),
        disposition: disposition.map(|d| d.ty.lossy()),
        disposition_params: disposition
            .map(|d| {
                d.params
                    .iter()
                    .flatten()
                    .map(|(k, v)| (k.lossy(), v.lossy()))
                    .collect()
            })
            .unwrap_or_default(),
        type_params: common
            .ty
            .params
            .iter()
            .flatten()
            .map(|(k, v)| (k.lossy(), v.lossy()))
            .collect(),
        children: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify;
    use imap_proto::types::{BodyContentSinglePart, ContentDisposition, ContentEncoding, ContentType};

    fn common<'a>(
        ty: &'a str,
        subtype: &'a str,
        params: Option<Vec<(&'a str, &'a str)>>,
        disposition: Option<ContentDisposition<'a>>,
    ) -> BodyContentCommon<'a> {
        BodyContentCommon {
            ty: ContentType { ty, subtype, params },
            disposition,
            language: None,
            location: None,
        }
    }

    fn single() -> BodyContentSinglePart<'static> {
        BodyContentSinglePart {
            id: None,
            md5: None,
            description: None,
            transfer_encoding: ContentEncoding::Base64,
            octets: 512,
        }
    }

    fn mixed_with_pdf() -> BodyStructure<'static> {
        BodyStructure::Multipart {
            common: common("MULTIPART", "MIXED", Some(vec![("BOUNDARY", "xyz")]), None),
            bodies: vec![
                BodyStructure::Text {
                    common: common("TEXT", "PLAIN", Some(vec![("CHARSET", "utf-8")]), None),
                    other: single(),
                    lines: 3,
                    extension: None,
                },
                BodyStructure::Basic {
                    common: common(
                        "APPLICATION",
                        "PDF",
                        Some(vec![("NAME", "scan.pdf")]),
                        Some(ContentDisposition {
                            ty: "ATTACHMENT",
                            params: Some(vec![("FILENAME", "invoice.pdf")]),
                        }),
                    ),
                    other: single(),
                    extension: None,
                },
            ],
            extension: None,
        }
    }

    #[test]
    fn body_structure_keeps_tree_and_params() {
        let part = to_body_part(&mixed_with_pdf());
        assert_eq!(part.mime(), "multipart/mixed");
        assert_eq!(part.children.len(), 2);

        let text = &part.children[0];
        assert_eq!(text.mime(), "text/plain");
        assert_eq!(text.disposition, None);
        assert_eq!(text.type_params, vec![("CHARSET".to_string(), "utf-8".to_string())]);

        let pdf = &part.children[1];
        assert_eq!(pdf.disposition.as_deref(), Some("ATTACHMENT"));
        assert_eq!(
            pdf.disposition_params,
            vec![("FILENAME".to_string(), "invoice.pdf".to_string())]
        );
        assert_eq!(pdf.filename(), Some("invoice.pdf"));
    }

    #[test]
    fn converted_structure_drives_attachment_detection() {
        let part = to_body_part(&mixed_with_pdf());
        assert_eq!(classify::attachment_names(&part, "<m@x>"), vec!["invoice.pdf"]);
    }

    #[test]
    fn missing_disposition_params_become_empty() {
        let inline = BodyStructure::Basic {
            common: common(
                "IMAGE",
                "PNG",
                None,
                Some(ContentDisposition {
                    ty: "inline",
                    params: None,
                }),
            ),
            other: single(),
            extension: None,
        };
        let part = to_body_part(&inline);
        assert_eq!(part.disposition.as_deref(), Some("inline"));
        assert!(part.disposition_params.is_empty());
        assert!(part.type_params.is_empty());
        assert_eq!(part.filename(), None);
    }

    #[test]
    fn lost_connections_are_stale() {
        assert!(command_error("NOOP", imap::Error::ConnectionLost).is_stale());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe");
        assert!(command_error("FETCH", imap::Error::Io(io)).is_stale());
        assert!(command_error("SELECT", imap::Error::No("Not authenticated".to_string())).is_stale());
        assert!(command_error("SEARCH", imap::Error::Bad("not connected".to_string())).is_stale());
    }

    #[test]
    fn server_refusals_are_command_errors() {
        match command_error("UID MOVE", imap::Error::No("[TRYCREATE] no such mailbox".to_string())) {
            SessionError::Command { command, reason } => {
                assert_eq!(command, "UID MOVE");
                assert!(reason.contains("TRYCREATE"));
            }
            other => panic!("expected command error, got {:?}", other),
        }
        assert!(!command_error("SEARCH", imap::Error::Bad("Unknown command".to_string())).is_stale());
    }
}
