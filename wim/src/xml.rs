//! The XML data resource: a UTF-16LE document indexing the images.
//!
//! The document records the file's total size and, per image, the name,
//! description, entry counts and timestamps. The image count here must
//! agree with both the header field and the number of metadata entries in
//! the blob table; `open` cross-checks all three.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{ErrorInner, Result};

/// Everything stored in the XML data resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlInfo {
    pub total_bytes: u64,
    pub images: Vec<ImageInfo>,
}

/// The per-image XML record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub name: String,
    pub description: Option<String>,
    pub dir_count: u64,
    pub file_count: u64,
    pub total_bytes: u64,
    /// Windows FILETIME.
    pub creation_time: u64,
    pub last_modification_time: u64,
}

fn decode_utf16le(data: &[u8]) -> Result<String> {
    let data = data.strip_prefix(&[0xFF, 0xFE]).unwrap_or(data);
    if data.len() % 2 != 0 {
        return Err(ErrorInner::Encoding("odd UTF-16 byte length in XML data").into());
    }
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    char::decode_utf16(units)
        .collect::<Result<String, _>>()
        .map_err(|_| ErrorInner::Encoding("unpaired UTF-16 surrogate in XML data").into())
}

fn encode_utf16le(s: &str) -> Vec<u8> {
    let mut out = vec![0xFF, 0xFE];
    out.extend(s.encode_utf16().flat_map(u16::to_le_bytes));
    out
}

fn parse_u64(text: &str) -> Result<u64> {
    text.trim()
        .parse()
        .map_err(|_| ErrorInner::Xml("expected a decimal integer").into())
}

fn parse_hex_u32(text: &str) -> Result<u64> {
    let t = text.trim();
    let t = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")).unwrap_or(t);
    u64::from_str_radix(t, 16).map_err(|_| ErrorInner::Xml("expected a hex integer").into())
}

impl XmlInfo {
    /// Parse the XML data resource payload.
    pub fn parse(data: &[u8]) -> Result<XmlInfo> {
        let text = decode_utf16le(data)?;
        let mut reader = Reader::from_str(&text);
        reader.config_mut().trim_text(true);

        let mut info = XmlInfo::default();
        let mut image: Option<ImageInfo> = None;
        let mut stack: Vec<String> = Vec::new();

        loop {
            match reader
                .read_event()
                .map_err(|_| ErrorInner::Xml("malformed XML data"))?
            {
                Event::Start(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_ascii_uppercase();
                    if stack.as_slice() == ["WIM"] && name == "IMAGE" {
                        image = Some(ImageInfo::default());
                    }
                    stack.push(name);
                }
                Event::End(_) => {
                    let name = stack.pop();
                    if stack.as_slice() == ["WIM"] && name.as_deref() == Some("IMAGE") {
                        info.images
                            .push(image.take().ok_or(ErrorInner::Xml("stray IMAGE end tag"))?);
                    }
                }
                Event::Text(t) => {
                    let text = t
                        .unescape()
                        .map_err(|_| ErrorInner::Xml("bad XML escape"))?;
                    let path: Vec<&str> = stack.iter().map(String::as_str).collect();
                    match (path.as_slice(), &mut image) {
                        (["WIM", "TOTALBYTES"], _) => info.total_bytes = parse_u64(&text)?,
                        (["WIM", "IMAGE", "NAME"], Some(img)) => img.name = text.into_owned(),
                        (["WIM", "IMAGE", "DESCRIPTION"], Some(img)) => {
                            img.description = Some(text.into_owned());
                        }
                        (["WIM", "IMAGE", "DIRCOUNT"], Some(img)) => {
                            img.dir_count = parse_u64(&text)?;
                        }
                        (["WIM", "IMAGE", "FILECOUNT"], Some(img)) => {
                            img.file_count = parse_u64(&text)?;
                        }
                        (["WIM", "IMAGE", "TOTALBYTES"], Some(img)) => {
                            img.total_bytes = parse_u64(&text)?;
                        }
                        (["WIM", "IMAGE", "CREATIONTIME", "HIGHPART"], Some(img)) => {
                            img.creation_time |= parse_hex_u32(&text)? << 32;
                        }
                        (["WIM", "IMAGE", "CREATIONTIME", "LOWPART"], Some(img)) => {
                            img.creation_time |= parse_hex_u32(&text)? & 0xFFFF_FFFF;
                        }
                        (["WIM", "IMAGE", "LASTMODIFICATIONTIME", "HIGHPART"], Some(img)) => {
                            img.last_modification_time |= parse_hex_u32(&text)? << 32;
                        }
                        (["WIM", "IMAGE", "LASTMODIFICATIONTIME", "LOWPART"], Some(img)) => {
                            img.last_modification_time |= parse_hex_u32(&text)? & 0xFFFF_FFFF;
                        }
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(info)
    }

    /// Serialize to the on-disk UTF-16LE form.
    #[must_use]
    pub fn emit(&self) -> Vec<u8> {
        use std::fmt::Write;

        let esc = |s: &str| quick_xml::escape::escape(s).into_owned();
        let mut x = String::new();
        x.push_str("<WIM>");
        let _ = write!(x, "<TOTALBYTES>{}</TOTALBYTES>", self.total_bytes);
        for (i, img) in self.images.iter().enumerate() {
            let _ = write!(x, "<IMAGE INDEX=\"{}\">", i + 1);
            let _ = write!(x, "<NAME>{}</NAME>", esc(&img.name));
            if let Some(desc) = &img.description {
                let _ = write!(x, "<DESCRIPTION>{}</DESCRIPTION>", esc(desc));
            }
            let _ = write!(x, "<DIRCOUNT>{}</DIRCOUNT>", img.dir_count);
            let _ = write!(x, "<FILECOUNT>{}</FILECOUNT>", img.file_count);
            let _ = write!(x, "<TOTALBYTES>{}</TOTALBYTES>", img.total_bytes);
            for (tag, value) in [
                ("CREATIONTIME", img.creation_time),
                ("LASTMODIFICATIONTIME", img.last_modification_time),
            ] {
                let _ = write!(
                    x,
                    "<{tag}><HIGHPART>0x{:08X}</HIGHPART><LOWPART>0x{:08X}</LOWPART></{tag}>",
                    value >> 32,
                    value & 0xFFFF_FFFF,
                );
            }
            x.push_str("</IMAGE>");
        }
        x.push_str("</WIM>");
        encode_utf16le(&x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let info = XmlInfo {
            total_bytes: 123_456_789,
            images: vec![
                ImageInfo {
                    name: "Base <Edition> & Co".into(),
                    description: Some("first image".into()),
                    dir_count: 10,
                    file_count: 42,
                    total_bytes: 1 << 30,
                    creation_time: 0x01DA_BEEF_1234_5678,
                    last_modification_time: 0x01DA_BEEF_8765_4321,
                },
                ImageInfo {
                    name: "Second".into(),
                    description: None,
                    ..Default::default()
                },
            ],
        };
        let bytes = info.emit();
        // UTF-16LE with BOM.
        assert_eq!(&bytes[..2], &[0xFF, 0xFE]);
        let parsed = XmlInfo::parse(&bytes).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn parses_unknown_elements() {
        let doc = "<WIM><TOTALBYTES>5</TOTALBYTES><WINDOWS><ARCH>9</ARCH></WINDOWS>\
                   <IMAGE INDEX=\"1\"><NAME>n</NAME><FLAGS>retail</FLAGS>\
                   <DIRCOUNT>1</DIRCOUNT></IMAGE></WIM>";
        let parsed = XmlInfo::parse(&encode_utf16le(doc)).unwrap();
        assert_eq!(parsed.total_bytes, 5);
        assert_eq!(parsed.images.len(), 1);
        assert_eq!(parsed.images[0].name, "n");
        assert_eq!(parsed.images[0].dir_count, 1);
    }

    #[test]
    fn rejects_garbage() {
        assert!(XmlInfo::parse(&[0x41]).is_err());
        let bad = encode_utf16le("<WIM><IMAGE></WIM>");
        assert!(XmlInfo::parse(&bad).is_err());
    }
}
