//! Static SDP bodies for the doorbell audio leg
//!
//! Nothing is negotiated. The answer always advertises one audio stream with
//! PCMU and telephone-event on a fixed RTP port, and offers are only parsed
//! far enough to log what the peer asked for.

use std::fmt;
use std::net::IpAddr;

/// RTP port advertised in every answer
pub const DOORBELL_RTP_PORT: u16 = 9654;

/// Content-Type for SDP bodies
pub const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Minimal SDP session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSession {
    pub version: u32,
    pub origin: SdpOrigin,
    pub session_name: String,
    pub connection: SdpConnection,
    pub media: Vec<SdpMedia>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpConnection {
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpMedia {
    pub media_type: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<String>,
    /// (payload type, encoding)
    pub rtpmap: Vec<(String, String)>,
    /// (payload type, parameters)
    pub fmtp: Vec<(String, String)>,
    pub direction: Option<String>,
}

fn address_type(ip: &IpAddr) -> &'static str {
    if ip.is_ipv4() {
        "IP4"
    } else {
        "IP6"
    }
}

impl SdpSession {
    /// The fixed answer sent in a 200 OK to the doorbell's INVITE
    pub fn doorbell_answer(local_ip: IpAddr) -> Self {
        let address_type = address_type(&local_ip).to_string();
        Self {
            version: 0,
            origin: SdpOrigin {
                username: "-".to_string(),
                session_id: chrono::Utc::now().timestamp().to_string(),
                session_version: "1".to_string(),
                address_type: address_type.clone(),
                address: local_ip.to_string(),
            },
            session_name: "doorbell".to_string(),
            connection: SdpConnection {
                address_type,
                address: local_ip.to_string(),
            },
            media: vec![SdpMedia {
                media_type: "audio".to_string(),
                port: DOORBELL_RTP_PORT,
                protocol: "RTP/AVP".to_string(),
                formats: vec!["0".to_string(), "101".to_string()],
                rtpmap: vec![
                    ("0".to_string(), "PCMU/8000".to_string()),
                    ("101".to_string(), "telephone-event/8000".to_string()),
                ],
                fmtp: vec![("101".to_string(), "0-15".to_string())],
                direction: Some("sendrecv".to_string()),
            }],
        }
    }

    /// Parse an SDP body. Returns None without an origin or connection line.
    pub fn parse(body: &str) -> Option<Self> {
        let mut version = 0;
        let mut origin = None;
        let mut session_name = String::new();
        let mut connection = None;
        let mut media: Vec<SdpMedia> = Vec::new();

        for line in body.lines() {
            let line = line.trim();
            let Some((field, value)) = line.split_once('=') else {
                continue;
            };

            match field {
                "v" => version = value.parse().unwrap_or(0),
                "o" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 6 {
                        origin = Some(SdpOrigin {
                            username: parts[0].to_string(),
                            session_id: parts[1].to_string(),
                            session_version: parts[2].to_string(),
                            address_type: parts[4].to_string(),
                            address: parts[5].to_string(),
                        });
                    }
                }
                "s" => session_name = value.to_string(),
                "c" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    // Media-level connection lines are ignored
                    if parts.len() >= 3 && media.is_empty() {
                        connection = Some(SdpConnection {
                            address_type: parts[1].to_string(),
                            address: parts[2].to_string(),
                        });
                    }
                }
                "m" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 4 {
                        media.push(SdpMedia {
                            media_type: parts[0].to_string(),
                            port: parts[1].parse().unwrap_or(0),
                            protocol: parts[2].to_string(),
                            formats: parts[3..].iter().map(|s| s.to_string()).collect(),
                            rtpmap: Vec::new(),
                            fmtp: Vec::new(),
                            direction: None,
                        });
                    }
                }
                "a" => {
                    let Some(current) = media.last_mut() else {
                        continue;
                    };
                    if let Some(rest) = value.strip_prefix("rtpmap:") {
                        if let Some((pt, encoding)) = rest.split_once(' ') {
                            current.rtpmap.push((pt.to_string(), encoding.to_string()));
                        }
                    } else if let Some(rest) = value.strip_prefix("fmtp:") {
                        if let Some((pt, params)) = rest.split_once(' ') {
                            current.fmtp.push((pt.to_string(), params.to_string()));
                        }
                    } else if matches!(value, "sendrecv" | "sendonly" | "recvonly" | "inactive") {
                        current.direction = Some(value.to_string());
                    }
                }
                _ => {}
            }
        }

        Some(Self {
            version,
            origin: origin?,
            session_name,
            connection: connection?,
            media,
        })
    }

    pub fn audio_media(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.media_type == "audio")
    }

    /// Encoding names offered on the audio stream, in offer order
    pub fn audio_codecs(&self) -> Vec<String> {
        let Some(audio) = self.audio_media() else {
            return Vec::new();
        };
        audio
            .formats
            .iter()
            .map(|pt| {
                audio
                    .rtpmap
                    .iter()
                    .find(|(p, _)| p == pt)
                    .map(|(_, encoding)| encoding.clone())
                    .unwrap_or_else(|| pt.clone())
            })
            .collect()
    }
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v={}\r\n", self.version)?;
        write!(
            f,
            "o={} {} {} IN {} {}\r\n",
            self.origin.username,
            self.origin.session_id,
            self.origin.session_version,
            self.origin.address_type,
            self.origin.address
        )?;
        write!(f, "s={}\r\n", self.session_name)?;
        write!(
            f,
            "c=IN {} {}\r\n",
            self.connection.address_type, self.connection.address
        )?;
        write!(f, "t=0 0\r\n")?;

        for media in &self.media {
            write!(
                f,
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                media.formats.join(" ")
            )?;
            for (pt, encoding) in &media.rtpmap {
                write!(f, "a=rtpmap:{} {}\r\n", pt, encoding)?;
            }
            for (pt, params) in &media.fmtp {
                write!(f, "a=fmtp:{} {}\r\n", pt, params)?;
            }
            if let Some(direction) = &media.direction {
                write!(f, "a={}\r\n", direction)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doorbell_answer_body() {
        let ip: IpAddr = "192.168.1.100".parse().unwrap();
        let sdp = SdpSession::doorbell_answer(ip).to_string();

        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("c=IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("m=audio 9654 RTP/AVP 0 101\r\n"));
        assert!(sdp.contains("a=rtpmap:0 PCMU/8000\r\n"));
        assert!(sdp.contains("a=rtpmap:101 telephone-event/8000\r\n"));
        assert!(sdp.contains("a=fmtp:101 0-15\r\n"));
        assert!(sdp.ends_with("a=sendrecv\r\n"));
        assert_eq!(sdp.matches("m=").count(), 1);
    }

    #[test]
    fn test_ipv6_answer() {
        let ip: IpAddr = "fe80::1".parse().unwrap();
        let sdp = SdpSession::doorbell_answer(ip).to_string();
        assert!(sdp.contains("c=IN IP6 fe80::1\r\n"));
    }

    #[test]
    fn test_parse_doorbell_offer() {
        let offer = "v=0\r\n\
o=doorbell 3747 1 IN IP4 192.168.1.20\r\n\
s=Talk\r\n\
c=IN IP4 192.168.1.20\r\n\
t=0 0\r\n\
m=audio 7078 RTP/AVP 8 0 101\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\n\
a=fmtp:101 0-11\r\n\
a=sendonly\r\n\
m=video 9078 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n";

        let sdp = SdpSession::parse(offer).unwrap();
        assert_eq!(sdp.origin.username, "doorbell");
        assert_eq!(sdp.session_name, "Talk");
        assert_eq!(sdp.connection.address, "192.168.1.20");
        assert_eq!(sdp.media.len(), 2);

        let audio = sdp.audio_media().unwrap();
        assert_eq!(audio.port, 7078);
        assert_eq!(audio.direction.as_deref(), Some("sendonly"));
        assert_eq!(audio.fmtp, vec![("101".to_string(), "0-11".to_string())]);
        // Payload 0 has no rtpmap line, so its number stands in
        assert_eq!(sdp.audio_codecs(), vec!["PCMA/8000", "0", "telephone-event/8000"]);
    }

    #[test]
    fn test_parse_requires_origin_and_connection() {
        assert!(SdpSession::parse("v=0\r\ns=-\r\n").is_none());
        assert!(SdpSession::parse("").is_none());
    }
}
