// GB28181 SDP
// INVITE 携带的媒体描述：y= 行携带 SSRC，f= 行携带媒体参数

use crate::{Result, SipError};
use rand::Rng;
use std::fmt;

/// 会话类型（s= 行）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// 实时点播
    Play,
    /// 历史回放
    Playback,
    /// 文件下载
    Download,
    /// 语音对讲
    Talk,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Play => "Play",
            SessionKind::Playback => "Playback",
            SessionKind::Download => "Download",
            SessionKind::Talk => "Talk",
        }
    }
}

/// f= 媒体描述：v/编码格式/分辨率/帧率/码率类型/码率a/编码格式/码率/采样率
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFormat {
    pub video_codec: u8,
    pub resolution: u8,
    pub frame_rate: u8,
    pub bitrate_type: u8,
    pub bitrate_kbps: u32,
    pub audio_codec: u8,
    pub audio_bitrate: u8,
    pub audio_sample_rate: u8,
}

impl Default for MediaFormat {
    /// H.264 / 1080P / 25fps / CBR / G.711 64kbps 8kHz
    fn default() -> Self {
        Self {
            video_codec: 2,
            resolution: 6,
            frame_rate: 25,
            bitrate_type: 1,
            bitrate_kbps: 20,
            audio_codec: 1,
            audio_bitrate: 8,
            audio_sample_rate: 1,
        }
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v/{}/{}/{}/{}/{}a/{}/{}/{}",
            self.video_codec,
            self.resolution,
            self.frame_rate,
            self.bitrate_type,
            self.bitrate_kbps,
            self.audio_codec,
            self.audio_bitrate,
            self.audio_sample_rate
        )
    }
}

/// RTP 映射
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub encoding_name: String,
    pub clock_rate: u32,
}

/// SDP 会话描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSession {
    pub version: u8,

    /// o= 行的用户名（平台 ID）
    pub owner_id: String,

    /// o= / c= 行地址
    pub address: String,

    pub session_name: String,

    /// m=video 端口
    pub media_port: u16,

    pub formats: Vec<u8>,

    pub rtpmap: Vec<RtpMap>,

    /// 方向属性（recvonly / sendonly / sendrecv）
    pub direction: String,

    /// y= 十位 SSRC
    pub ssrc: Option<String>,

    /// f= 行原文
    pub media_format: Option<String>,
}

impl SdpSession {
    /// 平台接收流的点播 SDP
    pub fn new(kind: SessionKind, owner_id: impl Into<String>, address: impl Into<String>, media_port: u16) -> Self {
        Self {
            version: 0,
            owner_id: owner_id.into(),
            address: address.into(),
            session_name: kind.as_str().to_string(),
            media_port,
            formats: vec![96, 97, 98],
            rtpmap: vec![
                RtpMap {
                    payload_type: 96,
                    encoding_name: "PS".to_string(),
                    clock_rate: 90000,
                },
                RtpMap {
                    payload_type: 97,
                    encoding_name: "H264".to_string(),
                    clock_rate: 90000,
                },
                RtpMap {
                    payload_type: 98,
                    encoding_name: "MPEG4".to_string(),
                    clock_rate: 90000,
                },
            ],
            direction: "recvonly".to_string(),
            ssrc: None,
            media_format: Some(MediaFormat::default().to_string()),
        }
    }

    pub fn with_ssrc(mut self, ssrc: impl Into<String>) -> Self {
        self.ssrc = Some(ssrc.into());
        self
    }

    /// 从字符串宽松解析，未知行忽略；缺少 v= / o= / m= 行时报错
    pub fn from_string(sdp: &str) -> Result<Self> {
        let (mut has_version, mut has_origin, mut has_media) = (false, false, false);
        let mut session = SdpSession {
            version: 0,
            owner_id: String::new(),
            address: String::new(),
            session_name: String::new(),
            media_port: 0,
            formats: Vec::new(),
            rtpmap: Vec::new(),
            direction: String::new(),
            ssrc: None,
            media_format: None,
        };

        for line in sdp.lines() {
            let line = line.trim();
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };

            match key {
                "v" => {
                    has_version = true;
                    session.version = value.trim().parse().unwrap_or(0);
                }
                "o" => {
                    has_origin = true;
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if let Some(owner) = parts.first() {
                        session.owner_id = owner.to_string();
                    }
                    if parts.len() >= 6 && session.address.is_empty() {
                        session.address = parts[5].to_string();
                    }
                }
                "s" => session.session_name = value.to_string(),
                "c" => {
                    if let Some(addr) = value.split_whitespace().nth(2) {
                        session.address = addr.to_string();
                    }
                }
                "m" => {
                    has_media = true;
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 4 {
                        session.media_port = parts[1].parse().unwrap_or(0);
                        session.formats = parts[3..].iter().filter_map(|s| s.parse().ok()).collect();
                    }
                }
                "a" => {
                    if let Some(map) = value.strip_prefix("rtpmap:") {
                        if let Some(rtpmap) = parse_rtpmap(map) {
                            session.rtpmap.push(rtpmap);
                        }
                    } else if matches!(value, "recvonly" | "sendonly" | "sendrecv") {
                        session.direction = value.to_string();
                    }
                }
                "y" => session.ssrc = Some(value.trim().to_string()),
                "f" => session.media_format = Some(value.trim().to_string()),
                _ => {}
            }
        }

        let missing = [("v=", has_version), ("o=", has_origin), ("m=", has_media)]
            .into_iter()
            .find(|(_, seen)| !seen);
        if let Some((line, _)) = missing {
            return Err(SipError::parse("sdp", preview(sdp), format!("missing {} line", line)));
        }

        Ok(session)
    }
}

fn preview(sdp: &str) -> String {
    sdp.chars().take(64).collect()
}

fn parse_rtpmap(text: &str) -> Option<RtpMap> {
    let (pt, rest) = text.split_once(' ')?;
    let (name, rate) = rest.split_once('/')?;
    Some(RtpMap {
        payload_type: pt.trim().parse().ok()?,
        encoding_name: name.trim().to_string(),
        clock_rate: rate.split('/').next()?.trim().parse().unwrap_or(90000),
    })
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v={}\r\n", self.version)?;
        write!(f, "o={} 0 0 IN IP4 {}\r\n", self.owner_id, self.address)?;
        write!(f, "s={}\r\n", self.session_name)?;
        write!(f, "c=IN IP4 {}\r\n", self.address)?;
        write!(f, "t=0 0\r\n")?;

        let formats: Vec<String> = self.formats.iter().map(|p| p.to_string()).collect();
        write!(f, "m=video {} RTP/AVP {}\r\n", self.media_port, formats.join(" "))?;
        write!(f, "a={}\r\n", self.direction)?;
        for map in &self.rtpmap {
            write!(f, "a=rtpmap:{} {}/{}\r\n", map.payload_type, map.encoding_name, map.clock_rate)?;
        }

        if let Some(ssrc) = &self.ssrc {
            write!(f, "y={}\r\n", ssrc)?;
        }
        if let Some(format) = &self.media_format {
            write!(f, "f={}\r\n", format)?;
        }
        Ok(())
    }
}

/// 生成十位 SSRC
///
/// 第 1 位 0 表示实时流（1 为历史），第 2-6 位取自 SIP 域 ID 的第 4-8 位，
/// 后 4 位随机。
pub fn generate_ssrc(realm: &str, realtime: bool) -> String {
    let domain_part: String = realm.chars().skip(3).take(5).collect();
    let domain_part = format!("{:0>5}", domain_part);
    let seq = rand::thread_rng().gen_range(0..10_000u32);
    format!("{}{}{:04}", if realtime { 0 } else { 1 }, domain_part, seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_play_sdp_lines() {
        let sdp = SdpSession::new(SessionKind::Play, "34020000002000000001", "192.168.1.100", 30000)
            .with_ssrc("0200001234")
            .to_string();

        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("o=34020000002000000001 0 0 IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("s=Play\r\n"));
        assert!(sdp.contains("c=IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("m=video 30000 RTP/AVP 96 97 98\r\n"));
        assert!(sdp.contains("a=recvonly\r\n"));
        assert!(sdp.contains("a=rtpmap:96 PS/90000\r\n"));
        assert!(sdp.contains("a=rtpmap:97 H264/90000\r\n"));
        assert!(sdp.contains("a=rtpmap:98 MPEG4/90000\r\n"));
        assert!(sdp.contains("y=0200001234\r\n"));
        assert!(sdp.ends_with("f=v/2/6/25/1/20a/1/8/1\r\n"));
    }

    #[test]
    fn test_parse_device_answer() {
        let answer = "v=0\r\n\
o=34020000001320000001 0 0 IN IP4 192.168.1.200\r\n\
s=Play\r\n\
c=IN IP4 192.168.1.200\r\n\
t=0 0\r\n\
m=video 15060 RTP/AVP 96\r\n\
a=sendonly\r\n\
a=rtpmap:96 PS/90000\r\n\
y=0200001234\r\n\
f=\r\n";

        let session = SdpSession::from_string(answer).unwrap();
        assert_eq!(session.owner_id, "34020000001320000001");
        assert_eq!(session.address, "192.168.1.200");
        assert_eq!(session.media_port, 15060);
        assert_eq!(session.formats, vec![96]);
        assert_eq!(session.direction, "sendonly");
        assert_eq!(session.rtpmap[0].encoding_name, "PS");
        assert_eq!(session.ssrc.as_deref(), Some("0200001234"));
    }

    #[test]
    fn test_parse_rejects_incomplete_sdp() {
        assert!(SdpSession::from_string("").is_err());

        let no_media = "v=0\r\no=34020000001320000001 0 0 IN IP4 192.168.1.200\r\ns=Play\r\n";
        let err = SdpSession::from_string(no_media).unwrap_err();
        assert!(err.to_string().contains("missing m= line"));
    }

    #[test]
    fn test_generate_ssrc() {
        let ssrc = generate_ssrc("3402000000", true);
        assert_eq!(ssrc.len(), 10);
        assert!(ssrc.starts_with("020000"));
        assert!(ssrc.chars().all(|c| c.is_ascii_digit()));

        assert!(generate_ssrc("3402000000", false).starts_with('1'));
    }
}
