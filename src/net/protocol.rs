//! Client wire protocol
//!
//! Every frame is `[u8 MsgType][payload]` and must be consumed exactly.
//! Replicated objects are written as `[u8 EntityType][u16 id][part][full]`;
//! the reader picks the per-kind payload decoder from `OBJECT_CODECS` by
//! the type tag.

use crate::game::constants::net::{
    MAX_NAME_LEN, MAX_OBJECTS_PER_UPDATE, MAX_STRING_LEN, MAX_TOKEN_LEN,
};
use crate::game::entity::{EntityId, EntityType};
use crate::net::stream::{DecodeError, EncodeError, NetMessage, StreamReader, StreamWriter};
use crate::util::vec2::Vec2;

/// Frame type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Join = 1,
    Disconnect = 2,
    Input = 3,
    Update = 4,
    Joined = 5,
    Ping = 6,
    Pong = 7,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MsgType::Join),
            2 => Some(MsgType::Disconnect),
            3 => Some(MsgType::Input),
            4 => Some(MsgType::Update),
            5 => Some(MsgType::Joined),
            6 => Some(MsgType::Ping),
            7 => Some(MsgType::Pong),
            _ => None,
        }
    }
}

// === Per-kind object payloads ===

#[derive(Debug, Clone, PartialEq)]
pub struct DecalPart {
    pub pos: Vec2,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecalFull {
    pub kind_name: String,
    pub scale: f32,
    pub ori: u8,
    pub layer: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmokePart {
    pub pos: Vec2,
    pub rad: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmokeFull {
    pub layer: u8,
    pub interior: bool,
}

impl NetMessage for DecalPart {
    fn serialize(&self, w: &mut StreamWriter) -> Result<(), EncodeError> {
        w.write_vec2(self.pos);
        Ok(())
    }

    fn deserialize(r: &mut StreamReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self { pos: r.read_vec2()? })
    }
}

impl NetMessage for DecalFull {
    fn serialize(&self, w: &mut StreamWriter) -> Result<(), EncodeError> {
        w.write_string(&self.kind_name, MAX_STRING_LEN)?;
        w.write_f32(self.scale);
        w.write_u8(self.ori);
        w.write_u8(self.layer);
        Ok(())
    }

    fn deserialize(r: &mut StreamReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            kind_name: r.read_string(MAX_STRING_LEN)?,
            scale: r.read_f32()?,
            ori: r.read_u8()?,
            layer: r.read_u8()?,
        })
    }
}

impl NetMessage for SmokePart {
    fn serialize(&self, w: &mut StreamWriter) -> Result<(), EncodeError> {
        w.write_vec2(self.pos);
        w.write_f32(self.rad);
        Ok(())
    }

    fn deserialize(r: &mut StreamReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            pos: r.read_vec2()?,
            rad: r.read_f32()?,
        })
    }
}

impl NetMessage for SmokeFull {
    fn serialize(&self, w: &mut StreamWriter) -> Result<(), EncodeError> {
        w.write_u8(self.layer);
        w.write_bool(self.interior);
        Ok(())
    }

    fn deserialize(r: &mut StreamReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            layer: r.read_u8()?,
            interior: r.read_bool()?,
        })
    }
}

/// Partial state of any replicated object
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectPart {
    Decal(DecalPart),
    Smoke(SmokePart),
}

/// Partial plus full state of any replicated object
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectSnapshot {
    Decal { part: DecalPart, full: DecalFull },
    Smoke { part: SmokePart, full: SmokeFull },
}

impl ObjectPart {
    pub fn kind(&self) -> EntityType {
        match self {
            ObjectPart::Decal(_) => EntityType::Decal,
            ObjectPart::Smoke(_) => EntityType::Smoke,
        }
    }

    fn serialize(&self, w: &mut StreamWriter) -> Result<(), EncodeError> {
        match self {
            ObjectPart::Decal(part) => part.serialize(w),
            ObjectPart::Smoke(part) => part.serialize(w),
        }
    }
}

impl ObjectSnapshot {
    pub fn kind(&self) -> EntityType {
        match self {
            ObjectSnapshot::Decal { .. } => EntityType::Decal,
            ObjectSnapshot::Smoke { .. } => EntityType::Smoke,
        }
    }

    fn serialize(&self, w: &mut StreamWriter) -> Result<(), EncodeError> {
        match self {
            ObjectSnapshot::Decal { part, full } => {
                part.serialize(w)?;
                full.serialize(w)
            }
            ObjectSnapshot::Smoke { part, full } => {
                part.serialize(w)?;
                full.serialize(w)
            }
        }
    }
}

/// Decoders for one entity kind
struct ObjectCodec {
    read_part: fn(&mut StreamReader<'_>) -> Result<ObjectPart, DecodeError>,
    read_snapshot: fn(&mut StreamReader<'_>) -> Result<ObjectSnapshot, DecodeError>,
}

fn read_decal_part(r: &mut StreamReader<'_>) -> Result<ObjectPart, DecodeError> {
    DecalPart::deserialize(r).map(ObjectPart::Decal)
}

fn read_decal_snapshot(r: &mut StreamReader<'_>) -> Result<ObjectSnapshot, DecodeError> {
    Ok(ObjectSnapshot::Decal {
        part: DecalPart::deserialize(r)?,
        full: DecalFull::deserialize(r)?,
    })
}

fn read_smoke_part(r: &mut StreamReader<'_>) -> Result<ObjectPart, DecodeError> {
    SmokePart::deserialize(r).map(ObjectPart::Smoke)
}

fn read_smoke_snapshot(r: &mut StreamReader<'_>) -> Result<ObjectSnapshot, DecodeError> {
    Ok(ObjectSnapshot::Smoke {
        part: SmokePart::deserialize(r)?,
        full: SmokeFull::deserialize(r)?,
    })
}

/// Indexed by `EntityType` tag
static OBJECT_CODECS: [Option<ObjectCodec>; EntityType::COUNT] = [
    None,
    Some(ObjectCodec {
        read_part: read_decal_part,
        read_snapshot: read_decal_snapshot,
    }),
    Some(ObjectCodec {
        read_part: read_smoke_part,
        read_snapshot: read_smoke_snapshot,
    }),
];

fn codec_for(tag: u8) -> Result<&'static ObjectCodec, DecodeError> {
    OBJECT_CODECS
        .get(tag as usize)
        .and_then(Option::as_ref)
        .ok_or(DecodeError::UnknownEntityType(tag))
}

/// A newly visible (or fully changed) object
#[derive(Debug, Clone, PartialEq)]
pub struct FullObject {
    pub id: EntityId,
    pub snapshot: ObjectSnapshot,
}

/// A partially changed object
#[derive(Debug, Clone, PartialEq)]
pub struct PartObject {
    pub id: EntityId,
    pub part: ObjectPart,
}

impl NetMessage for FullObject {
    fn serialize(&self, w: &mut StreamWriter) -> Result<(), EncodeError> {
        w.write_u8(self.snapshot.kind().as_u8());
        w.write_u16(self.id);
        self.snapshot.serialize(w)
    }

    fn deserialize(r: &mut StreamReader<'_>) -> Result<Self, DecodeError> {
        let codec = codec_for(r.read_u8()?)?;
        let id = r.read_u16()?;
        let snapshot = (codec.read_snapshot)(r)?;
        Ok(Self { id, snapshot })
    }
}

impl NetMessage for PartObject {
    fn serialize(&self, w: &mut StreamWriter) -> Result<(), EncodeError> {
        w.write_u8(self.part.kind().as_u8());
        w.write_u16(self.id);
        self.part.serialize(w)
    }

    fn deserialize(r: &mut StreamReader<'_>) -> Result<Self, DecodeError> {
        let codec = codec_for(r.read_u8()?)?;
        let id = r.read_u16()?;
        let part = (codec.read_part)(r)?;
        Ok(Self { id, part })
    }
}

// === Messages ===

/// Client asks to join the game on this socket
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JoinMsg {
    pub protocol: u32,
    pub join_token: String,
    pub name: String,
    pub is_mobile: bool,
}

/// Per-tick client input
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InputMsg {
    pub seq: u8,
    pub move_left: bool,
    pub move_right: bool,
    pub move_up: bool,
    pub move_down: bool,
    pub aim: Vec2,
    pub shoot: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PingMsg {
    pub timestamp: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinedMsg {
    pub team_mode: u8,
    pub map_name: String,
    pub tick_rate: u8,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PongMsg {
    pub timestamp: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectMsg {
    pub reason: String,
}

/// Replication delta or snapshot
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateMsg {
    pub deleted_ids: Vec<EntityId>,
    pub full_objects: Vec<FullObject>,
    pub part_objects: Vec<PartObject>,
}

impl UpdateMsg {
    pub fn is_empty(&self) -> bool {
        self.deleted_ids.is_empty() && self.full_objects.is_empty() && self.part_objects.is_empty()
    }
}

impl NetMessage for JoinMsg {
    fn serialize(&self, w: &mut StreamWriter) -> Result<(), EncodeError> {
        w.write_u32(self.protocol);
        w.write_string(&self.join_token, MAX_TOKEN_LEN)?;
        w.write_string(&self.name, MAX_NAME_LEN)?;
        w.write_bool(self.is_mobile);
        Ok(())
    }

    fn deserialize(r: &mut StreamReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            protocol: r.read_u32()?,
            join_token: r.read_string(MAX_TOKEN_LEN)?,
            name: r.read_string(MAX_NAME_LEN)?,
            is_mobile: r.read_bool()?,
        })
    }
}

impl NetMessage for InputMsg {
    fn serialize(&self, w: &mut StreamWriter) -> Result<(), EncodeError> {
        w.write_u8(self.seq);
        w.write_bool(self.move_left);
        w.write_bool(self.move_right);
        w.write_bool(self.move_up);
        w.write_bool(self.move_down);
        w.write_vec2(self.aim);
        w.write_bool(self.shoot);
        Ok(())
    }

    fn deserialize(r: &mut StreamReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            seq: r.read_u8()?,
            move_left: r.read_bool()?,
            move_right: r.read_bool()?,
            move_up: r.read_bool()?,
            move_down: r.read_bool()?,
            aim: r.read_vec2()?,
            shoot: r.read_bool()?,
        })
    }
}

impl NetMessage for PingMsg {
    fn serialize(&self, w: &mut StreamWriter) -> Result<(), EncodeError> {
        w.write_u32(self.timestamp);
        Ok(())
    }

    fn deserialize(r: &mut StreamReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            timestamp: r.read_u32()?,
        })
    }
}

impl NetMessage for JoinedMsg {
    fn serialize(&self, w: &mut StreamWriter) -> Result<(), EncodeError> {
        w.write_u8(self.team_mode);
        w.write_string(&self.map_name, MAX_STRING_LEN)?;
        w.write_u8(self.tick_rate);
        Ok(())
    }

    fn deserialize(r: &mut StreamReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            team_mode: r.read_u8()?,
            map_name: r.read_string(MAX_STRING_LEN)?,
            tick_rate: r.read_u8()?,
        })
    }
}

impl NetMessage for PongMsg {
    fn serialize(&self, w: &mut StreamWriter) -> Result<(), EncodeError> {
        w.write_u32(self.timestamp);
        Ok(())
    }

    fn deserialize(r: &mut StreamReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            timestamp: r.read_u32()?,
        })
    }
}

impl NetMessage for DisconnectMsg {
    fn serialize(&self, w: &mut StreamWriter) -> Result<(), EncodeError> {
        w.write_string(&self.reason, MAX_STRING_LEN)
    }

    fn deserialize(r: &mut StreamReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            reason: r.read_string(MAX_STRING_LEN)?,
        })
    }
}

impl NetMessage for UpdateMsg {
    fn serialize(&self, w: &mut StreamWriter) -> Result<(), EncodeError> {
        w.write_array(&self.deleted_ids, MAX_OBJECTS_PER_UPDATE, |w, id| {
            w.write_u16(*id);
            Ok(())
        })?;
        w.write_array(&self.full_objects, MAX_OBJECTS_PER_UPDATE, |w, obj| obj.serialize(w))?;
        w.write_array(&self.part_objects, MAX_OBJECTS_PER_UPDATE, |w, obj| obj.serialize(w))
    }

    fn deserialize(r: &mut StreamReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            deleted_ids: r.read_array(MAX_OBJECTS_PER_UPDATE, |r| r.read_u16())?,
            full_objects: r.read_array(MAX_OBJECTS_PER_UPDATE, FullObject::deserialize)?,
            part_objects: r.read_array(MAX_OBJECTS_PER_UPDATE, PartObject::deserialize)?,
        })
    }
}

/// Messages from client to server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMsg {
    Join(JoinMsg),
    Input(InputMsg),
    Ping(PingMsg),
}

/// Messages from server to client
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMsg {
    Joined(JoinedMsg),
    Update(UpdateMsg),
    Pong(PongMsg),
    Disconnect(DisconnectMsg),
}

impl NetMessage for ClientMsg {
    fn serialize(&self, w: &mut StreamWriter) -> Result<(), EncodeError> {
        match self {
            ClientMsg::Join(msg) => {
                w.write_u8(MsgType::Join as u8);
                msg.serialize(w)
            }
            ClientMsg::Input(msg) => {
                w.write_u8(MsgType::Input as u8);
                msg.serialize(w)
            }
            ClientMsg::Ping(msg) => {
                w.write_u8(MsgType::Ping as u8);
                msg.serialize(w)
            }
        }
    }

    fn deserialize(r: &mut StreamReader<'_>) -> Result<Self, DecodeError> {
        let tag = r.read_u8()?;
        match MsgType::from_u8(tag) {
            Some(MsgType::Join) => JoinMsg::deserialize(r).map(ClientMsg::Join),
            Some(MsgType::Input) => InputMsg::deserialize(r).map(ClientMsg::Input),
            Some(MsgType::Ping) => PingMsg::deserialize(r).map(ClientMsg::Ping),
            _ => Err(DecodeError::UnknownMessageType(tag)),
        }
    }
}

impl NetMessage for ServerMsg {
    fn serialize(&self, w: &mut StreamWriter) -> Result<(), EncodeError> {
        match self {
            ServerMsg::Joined(msg) => {
                w.write_u8(MsgType::Joined as u8);
                msg.serialize(w)
            }
            ServerMsg::Update(msg) => {
                w.write_u8(MsgType::Update as u8);
                msg.serialize(w)
            }
            ServerMsg::Pong(msg) => {
                w.write_u8(MsgType::Pong as u8);
                msg.serialize(w)
            }
            ServerMsg::Disconnect(msg) => {
                w.write_u8(MsgType::Disconnect as u8);
                msg.serialize(w)
            }
        }
    }

    fn deserialize(r: &mut StreamReader<'_>) -> Result<Self, DecodeError> {
        let tag = r.read_u8()?;
        match MsgType::from_u8(tag) {
            Some(MsgType::Joined) => JoinedMsg::deserialize(r).map(ServerMsg::Joined),
            Some(MsgType::Update) => UpdateMsg::deserialize(r).map(ServerMsg::Update),
            Some(MsgType::Pong) => PongMsg::deserialize(r).map(ServerMsg::Pong),
            Some(MsgType::Disconnect) => DisconnectMsg::deserialize(r).map(ServerMsg::Disconnect),
            _ => Err(DecodeError::UnknownMessageType(tag)),
        }
    }
}
