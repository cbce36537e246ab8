//! Control port reply framing and the commands onionwrap issues.
//!
//! Replies are CRLF-terminated lines of the form `CCCxText`, where `CCC` is
//! a three digit status and `x` is one of:
//! ```text
//! 250-ServiceID=abc...      mid reply line
//! 250+onions/current=       data line; body follows until a lone "."
//! 250 OK                    end of reply
//! 650 HS_DESC UPLOADED ...  asynchronous event (6xx)
//! ```

use std::path::PathBuf;

use data_encoding::HEXLOWER;

use super::ControlError;
use crate::key::ServiceKey;
use crate::port_spec::PortSpec;

pub const STATUS_OK: u16 = 250;

/// A complete reply: its status and the text of every line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    /// Text following the status of each line; data blocks are joined with `\n`
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Asynchronous event notification
    pub fn is_event(&self) -> bool {
        (600..700).contains(&self.status)
    }

    /// Text of the final line, which carries the human readable status
    pub fn message(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or_default()
    }

    /// Turn a non-250 reply into an error
    pub fn into_result(self) -> Result<Reply, ControlError> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(ControlError::Rejected {
                status: self.status,
                message: self.message().to_string(),
            })
        }
    }
}

/// Incremental reply parser fed one line at a time
#[derive(Debug, Default)]
pub struct ReplyParser {
    status: Option<u16>,
    lines: Vec<String>,
    data: Option<String>,
}

impl ReplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (with or without its line terminator).
    ///
    /// Returns the reply once its end line has been seen.
    pub fn push(&mut self, line: &str) -> Result<Option<Reply>, ControlError> {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(data) = self.data.as_mut() {
            if line == "." {
                if let Some(data) = self.data.take() {
                    self.lines.push(data);
                }
            } else {
                let line = line.strip_prefix('.').unwrap_or(line);
                data.push('\n');
                data.push_str(line);
            }
            return Ok(None);
        }

        if line.len() < 4 || !line.is_char_boundary(3) || !line.is_char_boundary(4) {
            return Err(ControlError::ProtocolViolation(format!(
                "reply line too short: {:?}",
                line
            )));
        }

        let (code, rest) = line.split_at(3);
        let status = match code.parse::<u16>() {
            Ok(status) if code.bytes().all(|b| b.is_ascii_digit()) => status,
            _ => {
                return Err(ControlError::ProtocolViolation(format!(
                    "bad status code in {:?}",
                    line
                )))
            }
        };

        match self.status {
            Some(expected) if expected != status => {
                return Err(ControlError::ProtocolViolation(format!(
                    "status changed from {} to {} within one reply",
                    expected, status
                )));
            }
            _ => self.status = Some(status),
        }

        let (separator, text) = rest.split_at(1);
        match separator {
            "-" => {
                self.lines.push(text.to_string());
                Ok(None)
            }
            "+" => {
                self.data = Some(text.to_string());
                Ok(None)
            }
            " " => {
                self.lines.push(text.to_string());
                let lines = std::mem::take(&mut self.lines);
                self.status = None;
                Ok(Some(Reply { status, lines }))
            }
            _ => Err(ControlError::ProtocolViolation(format!(
                "bad separator in {:?}",
                line
            ))),
        }
    }
}

/// Quote a string for the control protocol
pub fn quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('"');
    for c in s.chars() {
        match c {
            '"' | '\\' => {
                quoted.push('\\');
                quoted.push(c);
            }
            '\r' => quoted.push_str("\\r"),
            '\n' => quoted.push_str("\\n"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

fn unquote(s: &str) -> String {
    let inner = s
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Authentication details advertised by `PROTOCOLINFO`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub auth_methods: Vec<String>,
    pub cookie_file: Option<PathBuf>,
    pub version: Option<String>,
}

impl ProtocolInfo {
    pub fn supports(&self, method: &str) -> bool {
        self.auth_methods.iter().any(|m| m == method)
    }
}

pub fn parse_protocol_info(reply: &Reply) -> ProtocolInfo {
    let mut info = ProtocolInfo::default();

    for line in &reply.lines {
        if let Some(auth) = line.strip_prefix("AUTH ") {
            let (methods, cookie) = match auth.split_once(" COOKIEFILE=") {
                Some((methods, cookie)) => (methods, Some(cookie)),
                None => (auth, None),
            };
            if let Some(methods) = methods.trim().strip_prefix("METHODS=") {
                info.auth_methods = methods.split(',').map(str::to_string).collect();
            }
            info.cookie_file = cookie.map(|c| PathBuf::from(unquote(c.trim())));
        } else if let Some(version) = line.strip_prefix("VERSION Tor=") {
            let version = version.split_whitespace().next().unwrap_or_default();
            info.version = Some(unquote(version));
        }
    }

    info
}

/// How `AUTHENTICATE` proves who we are
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Null,
    Password(String),
    Cookie(Vec<u8>),
}

impl AuthMethod {
    pub fn command(&self) -> String {
        match self {
            AuthMethod::Null => "AUTHENTICATE".to_string(),
            AuthMethod::Password(secret) => format!("AUTHENTICATE {}", quote(secret)),
            AuthMethod::Cookie(cookie) => format!("AUTHENTICATE {}", HEXLOWER.encode(cookie)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::Null => "NULL",
            AuthMethod::Password(_) => "HASHEDPASSWORD",
            AuthMethod::Cookie(_) => "COOKIE",
        }
    }
}

/// Key argument of `ADD_ONION`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRequest<'a> {
    /// Let the daemon generate a key and return it
    Generate,
    /// Let the daemon generate a key and forget it
    GenerateDiscard,
    Supplied(&'a ServiceKey),
}

impl KeyRequest<'_> {
    /// Whether the reply must carry a `PrivateKey=` line
    pub fn expects_key(&self) -> bool {
        matches!(self, KeyRequest::Generate)
    }
}

pub fn add_onion_command(key: &KeyRequest<'_>, port: &PortSpec) -> String {
    match key {
        KeyRequest::Supplied(key) => {
            format!("ADD_ONION {} Port={}", key.to_wire_form(), port.to_port_arg())
        }
        KeyRequest::Generate => format!("ADD_ONION NEW:BEST Port={}", port.to_port_arg()),
        KeyRequest::GenerateDiscard => format!(
            "ADD_ONION NEW:BEST Port={} Flags=DiscardPK",
            port.to_port_arg()
        ),
    }
}

/// Fields of a successful `ADD_ONION` reply
#[derive(Debug, PartialEq, Eq)]
pub struct AddOnionReply {
    pub service_id: String,
    pub private_key: Option<ServiceKey>,
}

const SERVICE_ID_PREFIX: &str = "ServiceID=";
const PRIVATE_KEY_PREFIX: &str = "PrivateKey=";

pub fn parse_add_onion(reply: &Reply, key_requested: bool) -> Result<AddOnionReply, ControlError> {
    let mut service_id = None;
    let mut private_key = None;

    for line in &reply.lines {
        if let Some(id) = line.strip_prefix(SERVICE_ID_PREFIX) {
            service_id = Some(id.to_string());
        } else if let Some(key) = line.strip_prefix(PRIVATE_KEY_PREFIX) {
            if !key_requested {
                return Err(ControlError::ProtocolViolation(
                    "received a private key that was not requested".to_string(),
                ));
            }
            let key = ServiceKey::from_wire_form(key).map_err(|e| {
                ControlError::ProtocolViolation(format!("unusable PrivateKey: {}", e))
            })?;
            private_key = Some(key);
        }
    }

    let service_id = service_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            ControlError::ProtocolViolation("ADD_ONION reply is missing ServiceID".to_string())
        })?;

    if key_requested && private_key.is_none() {
        return Err(ControlError::ProtocolViolation(
            "ADD_ONION reply is missing the requested PrivateKey".to_string(),
        ));
    }

    Ok(AddOnionReply {
        service_id,
        private_key,
    })
}

/// A `650 HS_DESC` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorEvent {
    pub action: String,
    pub address: String,
    pub hs_dir: Option<String>,
    pub reason: Option<String>,
}

pub fn parse_descriptor_event(reply: &Reply) -> Option<DescriptorEvent> {
    let line = reply.lines.first()?;
    let mut fields = line.strip_prefix("HS_DESC ")?.split_whitespace();
    let action = fields.next()?.to_string();
    let address = fields.next()?.to_string();
    let _auth_type = fields.next();
    let hs_dir = fields.next().map(str::to_string);
    let reason = line
        .split_whitespace()
        .find_map(|f| f.strip_prefix("REASON="))
        .map(str::to_string);

    Some(DescriptorEvent {
        action,
        address,
        hs_dir,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyType;

    fn parse_all(lines: &[&str]) -> Vec<Reply> {
        let mut parser = ReplyParser::new();
        lines
            .iter()
            .filter_map(|l| parser.push(l).unwrap())
            .collect()
    }

    #[test]
    fn test_single_line_reply() {
        let replies = parse_all(&["250 OK\r\n"]);
        assert_eq!(
            replies,
            vec![Reply {
                status: 250,
                lines: vec!["OK".to_string()]
            }]
        );
        assert!(replies[0].is_ok());
        assert_eq!(replies[0].message(), "OK");
    }

    #[test]
    fn test_multi_line_reply() {
        let replies = parse_all(&["250-ServiceID=abcdef\r\n", "250 OK\r\n", "650 HS_DESC X\r\n"]);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].lines, vec!["ServiceID=abcdef", "OK"]);
        assert!(replies[1].is_event());
    }

    #[test]
    fn test_data_block_with_dot_stuffing() {
        let replies = parse_all(&[
            "250+config-text=\r\n",
            "SocksPort 9050\r\n",
            "..hidden\r\n",
            ".\r\n",
            "250 OK\r\n",
        ]);
        assert_eq!(
            replies[0].lines,
            vec!["config-text=\nSocksPort 9050\n.hidden", "OK"]
        );
    }

    #[test]
    fn test_malformed_lines() {
        let mut parser = ReplyParser::new();
        assert!(matches!(
            parser.push("25"),
            Err(ControlError::ProtocolViolation(_))
        ));

        let mut parser = ReplyParser::new();
        assert!(parser.push("2x0 OK").is_err());

        let mut parser = ReplyParser::new();
        assert!(parser.push("250*OK").is_err());

        let mut parser = ReplyParser::new();
        parser.push("250-ServiceID=abc").unwrap();
        assert!(parser.push("550 oops").is_err());
    }

    #[test]
    fn test_rejected_reply() {
        let reply = parse_all(&["515 Authentication failed: Password did not match\r\n"])
            .pop()
            .unwrap();
        match reply.into_result() {
            Err(ControlError::Rejected { status, message }) => {
                assert_eq!(status, 515);
                assert_eq!(message, "Authentication failed: Password did not match");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_protocol_info() {
        let reply = parse_all(&[
            "250-PROTOCOLINFO 1\r\n",
            "250-AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE=\"/run/tor/control.authcookie\"\r\n",
            "250-VERSION Tor=\"0.4.8.10\"\r\n",
            "250 OK\r\n",
        ])
        .pop()
        .unwrap();

        let info = parse_protocol_info(&reply);
        assert_eq!(info.auth_methods, vec!["COOKIE", "SAFECOOKIE"]);
        assert!(info.supports("COOKIE"));
        assert!(!info.supports("NULL"));
        assert_eq!(
            info.cookie_file,
            Some(PathBuf::from("/run/tor/control.authcookie"))
        );
        assert_eq!(info.version.as_deref(), Some("0.4.8.10"));
    }

    #[test]
    fn test_auth_commands() {
        assert_eq!(AuthMethod::Null.command(), "AUTHENTICATE");
        assert_eq!(
            AuthMethod::Password("pa\"ss".to_string()).command(),
            "AUTHENTICATE \"pa\\\"ss\""
        );
        assert_eq!(
            AuthMethod::Cookie(vec![0xde, 0xad]).command(),
            "AUTHENTICATE dead"
        );
    }

    #[test]
    fn test_add_onion_commands() {
        let port: PortSpec = "80,8080".parse().unwrap();
        assert_eq!(
            add_onion_command(&KeyRequest::GenerateDiscard, &port),
            "ADD_ONION NEW:BEST Port=80,127.0.0.1:8080 Flags=DiscardPK"
        );
        assert_eq!(
            add_onion_command(&KeyRequest::Generate, &port),
            "ADD_ONION NEW:BEST Port=80,127.0.0.1:8080"
        );

        let key = ServiceKey::new(KeyType::Rsa1024, b"hello".to_vec());
        assert_eq!(
            add_onion_command(&KeyRequest::Supplied(&key), &port),
            "ADD_ONION RSA1024:aGVsbG8= Port=80,127.0.0.1:8080"
        );
    }

    #[test]
    fn test_parse_add_onion() {
        let reply = Reply {
            status: 250,
            lines: vec![
                "ServiceID=exampleonion".to_string(),
                "PrivateKey=RSA1024:aGVsbG8=".to_string(),
                "OK".to_string(),
            ],
        };

        let parsed = parse_add_onion(&reply, true).unwrap();
        assert_eq!(parsed.service_id, "exampleonion");
        assert_eq!(
            parsed.private_key,
            Some(ServiceKey::new(KeyType::Rsa1024, b"hello".to_vec()))
        );

        assert!(matches!(
            parse_add_onion(&reply, false),
            Err(ControlError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_parse_add_onion_missing_fields() {
        let no_id = Reply {
            status: 250,
            lines: vec!["OK".to_string()],
        };
        assert!(matches!(
            parse_add_onion(&no_id, false),
            Err(ControlError::ProtocolViolation(_))
        ));

        let no_key = Reply {
            status: 250,
            lines: vec!["ServiceID=exampleonion".to_string(), "OK".to_string()],
        };
        assert!(parse_add_onion(&no_key, false).is_ok());
        assert!(matches!(
            parse_add_onion(&no_key, true),
            Err(ControlError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_parse_descriptor_event() {
        let reply = Reply {
            status: 650,
            lines: vec!["HS_DESC UPLOADED exampleonion UNKNOWN $ABCDEF~relay".to_string()],
        };
        let event = parse_descriptor_event(&reply).unwrap();
        assert_eq!(event.action, "UPLOADED");
        assert_eq!(event.address, "exampleonion");
        assert_eq!(event.hs_dir.as_deref(), Some("$ABCDEF~relay"));
        assert_eq!(event.reason, None);

        let reply = Reply {
            status: 650,
            lines: vec![
                "HS_DESC FAILED exampleonion UNKNOWN $ABCDEF REASON=UPLOAD_REJECTED".to_string(),
            ],
        };
        let event = parse_descriptor_event(&reply).unwrap();
        assert_eq!(event.reason.as_deref(), Some("UPLOAD_REJECTED"));

        let reply = Reply {
            status: 650,
            lines: vec!["CIRC 1 BUILT".to_string()],
        };
        assert!(parse_descriptor_event(&reply).is_none());
    }
}
