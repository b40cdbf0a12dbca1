//! 二进制 FBX 节点树
//!
//! 文件布局：27 字节文件头（魔数 + 版本号），之后是节点记录，
//! 以一个全零的空记录结束。每个节点记录：
//!
//! ```text
//! end_offset      u32 / u64   节点结束的绝对偏移
//! num_properties  u32 / u64
//! property_bytes  u32 / u64
//! name_len        u8
//! name            [u8; name_len]
//! properties      ...
//! children        ... + 空记录
//! ```
//!
//! 版本 7500 起三个头字段为 64 位。

use std::io::Read;

use flate2::read::ZlibDecoder;

use crate::core::error::{MeshLoadError, Result};

const MAGIC: &[u8; 23] = b"Kaydara FBX Binary  \0\x1a\0";
const HEADER_LEN: usize = 27;
/// 单个数组属性解码后的上限
const MAX_ARRAY_BYTES: usize = 256 << 20;
/// deflate 的最大压缩比
const MAX_INFLATE_RATIO: usize = 1032;
/// 节点嵌套上限
const MAX_NODE_DEPTH: usize = 64;

/// 节点属性
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    I16(i16),
    Bool(bool),
    I32(i32),
    F32(f32),
    F64(f64),
    I64(i64),
    F32Array(Vec<f32>),
    F64Array(Vec<f64>),
    I64Array(Vec<i64>),
    I32Array(Vec<i32>),
    BoolArray(Vec<bool>),
    String(String),
    Raw(Vec<u8>),
}

impl Property {
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Property::I16(v) => Some(v as i64),
            Property::I32(v) => Some(v as i64),
            Property::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Property::F32(v) => Some(v as f64),
            Property::F64(v) => Some(v),
            Property::I16(v) => Some(v as f64),
            Property::I32(v) => Some(v as f64),
            Property::I64(v) => Some(v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Property::String(s) => Some(s),
            _ => None,
        }
    }

    /// 数值数组统一转成 f64
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        match self {
            Property::F64Array(v) => Some(v.clone()),
            Property::F32Array(v) => Some(v.iter().map(|&x| x as f64).collect()),
            _ => None,
        }
    }

    /// 整数数组统一转成 i32
    pub fn to_i32_vec(&self) -> Option<Vec<i32>> {
        match self {
            Property::I32Array(v) => Some(v.clone()),
            Property::I64Array(v) => Some(v.iter().map(|&x| x as i32).collect()),
            _ => None,
        }
    }
}

/// 节点
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Node {
    pub name: String,
    pub properties: Vec<Property>,
    pub children: Vec<Node>,
}

impl Node {
    /// 第一个同名子节点
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn property(&self, index: usize) -> Option<&Property> {
        self.properties.get(index)
    }
}

/// 解析后的文件
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub version: u32,
    pub nodes: Vec<Node>,
}

impl Document {
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

fn parse_error(msg: impl Into<String>) -> crate::core::error::SandboxError {
    MeshLoadError::ParseError(msg.into()).into()
}

/// 是否以二进制 FBX 魔数开头
pub fn is_binary_fbx(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN && data.starts_with(MAGIC)
}

/// 解析整个文件
pub fn parse(data: &[u8]) -> Result<Document> {
    if !is_binary_fbx(data) {
        return Err(MeshLoadError::UnsupportedFormat("not a binary FBX file (ASCII FBX is not supported)".to_string()).into());
    }

    let version = u32::from_le_bytes([data[23], data[24], data[25], data[26]]);
    let mut reader = Reader {
        data,
        pos: HEADER_LEN,
        wide: version >= 7500,
    };

    let mut nodes = Vec::new();
    while reader.pos < data.len() {
        match reader.read_node(0)? {
            Some(node) => nodes.push(node),
            None => break,
        }
    }

    tracing::trace!(version, top_level = nodes.len(), "FBX document parsed");
    Ok(Document { version, nodes })
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    /// 64 位节点头
    wide: bool,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| parse_error(format!("unexpected end of file at offset {}", self.pos)))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn header_field(&mut self) -> Result<u64> {
        if self.wide {
            Ok(u64::from_le_bytes(self.array()?))
        } else {
            Ok(self.u32()? as u64)
        }
    }

    /// 读一个节点，空记录返回 None
    fn read_node(&mut self, depth: usize) -> Result<Option<Node>> {
        if depth > MAX_NODE_DEPTH {
            return Err(parse_error(format!(
                "nodes nested deeper than {} at offset {}",
                MAX_NODE_DEPTH, self.pos
            )));
        }
        let start = self.pos;
        let end_offset = self.header_field()?;
        let num_properties = self.header_field()?;
        let _property_bytes = self.header_field()?;
        let name_len = self.u8()? as usize;

        if end_offset == 0 {
            return Ok(None);
        }
        let end_offset = usize::try_from(end_offset)
            .ok()
            .filter(|&end| end > start && end <= self.data.len())
            .ok_or_else(|| parse_error(format!("node at {} has invalid end offset {}", start, end_offset)))?;

        let name = String::from_utf8_lossy(self.take(name_len)?).into_owned();

        let mut properties = Vec::with_capacity(num_properties.min(64) as usize);
        for _ in 0..num_properties {
            properties.push(self.read_property()?);
        }

        let mut children = Vec::new();
        while self.pos < end_offset {
            match self.read_node(depth + 1)? {
                Some(child) => children.push(child),
                None => break,
            }
        }

        if self.pos != end_offset {
            return Err(parse_error(format!(
                "node '{}' ends at {} but its record says {}",
                name, self.pos, end_offset
            )));
        }

        Ok(Some(Node {
            name,
            properties,
            children,
        }))
    }

    fn read_property(&mut self) -> Result<Property> {
        let code = self.u8()?;
        let property = match code {
            b'Y' => Property::I16(i16::from_le_bytes(self.array()?)),
            b'C' => Property::Bool(self.u8()? != 0),
            b'I' => Property::I32(i32::from_le_bytes(self.array()?)),
            b'F' => Property::F32(f32::from_le_bytes(self.array()?)),
            b'D' => Property::F64(f64::from_le_bytes(self.array()?)),
            b'L' => Property::I64(i64::from_le_bytes(self.array()?)),
            b'f' => Property::F32Array(self.read_array(4, |b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))?),
            b'd' => Property::F64Array(self.read_array(8, |b| {
                f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
            })?),
            b'l' => Property::I64Array(self.read_array(8, |b| {
                i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
            })?),
            b'i' => Property::I32Array(self.read_array(4, |b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))?),
            b'b' => Property::BoolArray(self.read_array(1, |b| b[0] != 0)?),
            b'S' => {
                let len = self.u32()? as usize;
                Property::String(String::from_utf8_lossy(self.take(len)?).into_owned())
            }
            b'R' => {
                let len = self.u32()? as usize;
                Property::Raw(self.take(len)?.to_vec())
            }
            other => {
                return Err(parse_error(format!(
                    "unknown property type '{}' at offset {}",
                    other as char,
                    self.pos - 1
                )))
            }
        };
        Ok(property)
    }

    /// 数组属性：长度、编码（0 原始，1 zlib）、压缩后长度、数据
    fn read_array<T>(&mut self, element_size: usize, convert: impl Fn(&[u8]) -> T) -> Result<Vec<T>> {
        let count = self.u32()? as usize;
        let encoding = self.u32()?;
        let stored_len = self.u32()? as usize;
        let stored = self.take(stored_len)?;
        let expected = count
            .checked_mul(element_size)
            .filter(|&len| len <= MAX_ARRAY_BYTES)
            .ok_or_else(|| parse_error(format!("array of {} elements is too large", count)))?;

        let raw;
        let bytes = match encoding {
            0 => stored,
            1 => {
                if expected > stored_len.saturating_mul(MAX_INFLATE_RATIO) {
                    return Err(parse_error(format!(
                        "array of {} elements cannot inflate from {} bytes",
                        count, stored_len
                    )));
                }
                let mut out = Vec::with_capacity(expected);
                ZlibDecoder::new(stored)
                    .take(expected as u64)
                    .read_to_end(&mut out)
                    .map_err(|e| parse_error(format!("failed to inflate array: {}", e)))?;
                raw = out;
                &raw[..]
            }
            other => return Err(parse_error(format!("unknown array encoding {}", other))),
        };

        if bytes.len() < expected {
            return Err(parse_error(format!(
                "array of {} elements needs {} bytes, found {}",
                count,
                expected,
                bytes.len()
            )));
        }
        Ok(bytes[..expected].chunks_exact(element_size).map(convert).collect())
    }
}

/// 测试用的二进制 FBX 写入器
#[cfg(test)]
pub(crate) mod writer {
    use std::io::Write;

    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    use super::{Node, Property, HEADER_LEN, MAGIC};

    pub fn write(version: u32, nodes: &[Node], compress_arrays: bool) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&version.to_le_bytes());
        assert_eq!(out.len(), HEADER_LEN);

        let wide = version >= 7500;
        for node in nodes {
            write_node(&mut out, node, wide, compress_arrays);
        }
        write_null(&mut out, wide);
        out
    }

    fn field(out: &mut Vec<u8>, value: u64, wide: bool) {
        if wide {
            out.extend_from_slice(&value.to_le_bytes());
        } else {
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
    }

    fn write_null(out: &mut Vec<u8>, wide: bool) {
        let len = if wide { 25 } else { 13 };
        out.extend(std::iter::repeat(0u8).take(len));
    }

    fn write_node(out: &mut Vec<u8>, node: &Node, wide: bool, compress: bool) {
        let mut props = Vec::new();
        for p in &node.properties {
            write_property(&mut props, p, compress);
        }

        let header_start = out.len();
        field(out, 0, wide);
        field(out, node.properties.len() as u64, wide);
        field(out, props.len() as u64, wide);
        out.push(node.name.len() as u8);
        out.extend_from_slice(node.name.as_bytes());
        out.extend_from_slice(&props);

        if !node.children.is_empty() {
            for child in &node.children {
                write_node(out, child, wide, compress);
            }
            write_null(out, wide);
        }

        let end = out.len() as u64;
        if wide {
            out[header_start..header_start + 8].copy_from_slice(&end.to_le_bytes());
        } else {
            out[header_start..header_start + 4].copy_from_slice(&(end as u32).to_le_bytes());
        }
    }

    fn write_array(out: &mut Vec<u8>, code: u8, count: usize, bytes: Vec<u8>, compress: bool) {
        out.push(code);
        out.extend_from_slice(&(count as u32).to_le_bytes());
        let stored = if compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&bytes).unwrap();
            encoder.finish().unwrap()
        } else {
            bytes
        };
        out.extend_from_slice(&(compress as u32).to_le_bytes());
        out.extend_from_slice(&(stored.len() as u32).to_le_bytes());
        out.extend_from_slice(&stored);
    }

    fn write_property(out: &mut Vec<u8>, property: &Property, compress: bool) {
        match property {
            Property::I16(v) => {
                out.push(b'Y');
                out.extend_from_slice(&v.to_le_bytes());
            }
            Property::Bool(v) => {
                out.push(b'C');
                out.push(*v as u8);
            }
            Property::I32(v) => {
                out.push(b'I');
                out.extend_from_slice(&v.to_le_bytes());
            }
            Property::F32(v) => {
                out.push(b'F');
                out.extend_from_slice(&v.to_le_bytes());
            }
            Property::F64(v) => {
                out.push(b'D');
                out.extend_from_slice(&v.to_le_bytes());
            }
            Property::I64(v) => {
                out.push(b'L');
                out.extend_from_slice(&v.to_le_bytes());
            }
            Property::F32Array(v) => write_array(out, b'f', v.len(), v.iter().flat_map(|x| x.to_le_bytes()).collect(), compress),
            Property::F64Array(v) => write_array(out, b'd', v.len(), v.iter().flat_map(|x| x.to_le_bytes()).collect(), compress),
            Property::I64Array(v) => write_array(out, b'l', v.len(), v.iter().flat_map(|x| x.to_le_bytes()).collect(), compress),
            Property::I32Array(v) => write_array(out, b'i', v.len(), v.iter().flat_map(|x| x.to_le_bytes()).collect(), compress),
            Property::BoolArray(v) => write_array(out, b'b', v.len(), v.iter().map(|&x| x as u8).collect(), compress),
            Property::String(s) => {
                out.push(b'S');
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Property::Raw(bytes) => {
                out.push(b'R');
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(bytes);
            }
        }
    }

    /// 便捷构造
    pub fn node(name: &str, properties: Vec<Property>, children: Vec<Node>) -> Node {
        Node {
            name: name.to_string(),
            properties,
            children,
        }
    }
}
