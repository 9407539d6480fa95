// MANSCDP 消息体
// MESSAGE 请求携带的 GB28181 XML 命令（Keepalive / Catalog 等）

use crate::{Result, SipError};
use quick_xml::de::from_str;
use serde::Deserialize;

pub const CMD_KEEPALIVE: &str = "Keepalive";
pub const CMD_CATALOG: &str = "Catalog";

/// MANSCDP 文档（根节点为 Notify / Response / Query 之一，不区分）
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ManscdpMessage {
    pub cmd_type: String,

    #[serde(rename = "SN", default)]
    pub sn: Option<u32>,

    #[serde(rename = "DeviceID")]
    pub device_id: String,

    /// 心跳状态（OK / ERROR）
    #[serde(default)]
    pub status: Option<String>,

    /// 心跳附加信息，异常时列出故障设备
    #[serde(default)]
    pub info: Option<KeepaliveInfo>,

    /// 目录总数（仅目录应答）
    #[serde(default)]
    pub sum_num: Option<u32>,

    #[serde(default)]
    pub device_list: Option<DeviceList>,
}

#[derive(Debug, Deserialize, Default, PartialEq)]
pub struct KeepaliveInfo {
    #[serde(rename = "DeviceID", default)]
    pub device_ids: Vec<String>,
}

/// 设备列表
#[derive(Debug, Deserialize, PartialEq)]
pub struct DeviceList {
    #[serde(rename = "@Num", default)]
    pub num: Option<u32>,

    #[serde(rename = "Item", default)]
    pub items: Vec<CatalogItem>,
}

/// 目录项（一个通道）
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogItem {
    #[serde(rename = "DeviceID")]
    pub device_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub manufacturer: String,

    #[serde(default)]
    pub model: String,

    /// ON / OFF
    #[serde(default)]
    pub status: String,

    #[serde(rename = "ParentID", default)]
    pub parent_id: String,
}

impl ManscdpMessage {
    pub fn from_xml(xml: &str) -> Result<Self> {
        from_str(xml.trim()).map_err(|e| SipError::Xml(format!("invalid MANSCDP body: {}", e)))
    }

    /// 从消息体字节解码（GB2312 声明的文档按宽松 UTF-8 读取）
    pub fn from_body(body: &[u8]) -> Result<Self> {
        Self::from_xml(&String::from_utf8_lossy(body))
    }

    pub fn is_keepalive(&self) -> bool {
        self.cmd_type.eq_ignore_ascii_case(CMD_KEEPALIVE)
    }

    pub fn is_catalog(&self) -> bool {
        self.cmd_type.eq_ignore_ascii_case(CMD_CATALOG)
    }

    pub fn items(&self) -> &[CatalogItem] {
        self.device_list
            .as_ref()
            .map(|list| list.items.as_slice())
            .unwrap_or(&[])
    }
}

/// 目录查询（发送给设备）
#[derive(Debug, Clone)]
pub struct CatalogQuery {
    pub sn: u32,
    pub device_id: String,
}

impl CatalogQuery {
    pub fn new(sn: u32, device_id: impl Into<String>) -> Self {
        Self {
            sn,
            device_id: device_id.into(),
        }
    }

    pub fn to_xml(&self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n\
<Query>\r\n\
<CmdType>Catalog</CmdType>\r\n\
<SN>{}</SN>\r\n\
<DeviceID>{}</DeviceID>\r\n\
</Query>\r\n",
            self.sn, self.device_id
        )
    }
}
