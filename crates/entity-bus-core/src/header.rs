//! The routing header carried in front of every entity message.

use serde::{Deserialize, Serialize};

use crate::types::{
    CorrelationId, ENTITYID_DEFAULT, EntityId, Metainfo, MsgMode, Status,
};

/// Metainfo keys used when a protocol carries the header out of band.
pub mod keys {
    pub const DESTNAME: &str = "fmq_destname";
    pub const DESTID: &str = "fmq_destid";
    pub const SRCID: &str = "fmq_srcid";
    pub const MODE: &str = "fmq_mode";
    pub const CORRID: &str = "fmq_corrid";
    pub const STATUS: &str = "fmq_status";
    pub const SUBPATH: &str = "fmq_subpath";
    pub const TYPE: &str = "fmq_type";
    pub const PATH: &str = "fmq_path";
    pub const VIRTUAL_SESSION_ID: &str = "fmq_virtsessid";
}

/// Entity message header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Header {
    pub destid: EntityId,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub destname: String,
    pub srcid: EntityId,
    pub mode: MsgMode,
    pub status: Status,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub corrid: CorrelationId,
    /// Flattened metainfo pairs: key, value, key, value, ...
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<String>,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            destid: ENTITYID_DEFAULT,
            destname: String::new(),
            srcid: ENTITYID_DEFAULT,
            mode: MsgMode::Request,
            status: Status::Ok,
            path: String::new(),
            type_name: String::new(),
            corrid: 0,
            meta: Vec::new(),
        }
    }
}

impl Header {
    /// Header of a reply addressed back to the requester.
    #[must_use]
    pub fn reply(
        destid: EntityId,
        srcid: EntityId,
        status: Status,
        type_name: impl Into<String>,
        corrid: CorrelationId,
    ) -> Self {
        Self {
            destid,
            srcid,
            mode: MsgMode::Reply,
            status,
            type_name: type_name.into(),
            corrid,
            ..Self::default()
        }
    }

    /// Move metainfo pairs into the header's `meta` list.
    pub fn fold_metainfo(&mut self, metainfo: &Metainfo) {
        self.meta.reserve(metainfo.len() * 2);
        for (key, value) in metainfo {
            self.meta.push(key.clone());
            self.meta.push(value.clone());
        }
    }

    /// Unpack the `meta` list into a metainfo map. A trailing odd key is dropped.
    #[must_use]
    pub fn take_metainfo(&mut self) -> Metainfo {
        let meta = std::mem::take(&mut self.meta);
        meta.chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect()
    }

    /// Write the header into metainfo for protocols that carry it out of band.
    pub fn write_metainfo(&self, metainfo: &mut Metainfo) {
        if !self.destname.is_empty() {
            metainfo.insert(keys::DESTNAME.into(), self.destname.clone());
        }
        metainfo.insert(keys::DESTID.into(), self.destid.to_string());
        metainfo.insert(keys::SRCID.into(), self.srcid.to_string());
        metainfo.insert(keys::MODE.into(), self.mode.as_str().into());
        metainfo.insert(keys::CORRID.into(), self.corrid.to_string());
        metainfo.insert(keys::STATUS.into(), self.status.as_str().into());
        metainfo.insert(keys::PATH.into(), self.path.clone());
        metainfo.insert(keys::TYPE.into(), self.type_name.clone());
    }

    /// Read a header from metainfo. Missing keys keep their defaults.
    ///
    /// Returns the header and whether the sender identified itself.
    #[must_use]
    pub fn read_metainfo(metainfo: &Metainfo) -> (Self, bool) {
        let mut header = Self::default();
        let mut has_source = false;
        if let Some(name) = metainfo.get(keys::DESTNAME) {
            header.destname.clone_from(name);
        }
        if let Some(id) = metainfo.get(keys::DESTID).and_then(|v| v.parse().ok()) {
            header.destid = id;
        }
        if let Some(id) = metainfo.get(keys::SRCID).and_then(|v| v.parse().ok()) {
            header.srcid = id;
            has_source = true;
        }
        if let Some(mode) = metainfo.get(keys::MODE).and_then(|v| MsgMode::parse(v)) {
            header.mode = mode;
        }
        if let Some(corrid) = metainfo.get(keys::CORRID).and_then(|v| v.parse().ok()) {
            header.corrid = corrid;
        }
        if let Some(status) = metainfo.get(keys::STATUS).and_then(|v| Status::parse(v)) {
            header.status = status;
        }
        if let Some(path) = metainfo.get(keys::PATH) {
            header.path.clone_from(path);
        }
        if let Some(type_name) = metainfo.get(keys::TYPE) {
            header.type_name.clone_from(type_name);
        }
        (header, has_source)
    }
}
