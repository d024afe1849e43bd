//! Binary codec helpers: big-endian extraction, FCI scanning, name
//! normalization

use iso7816_tlv::ber::{Tag, Tlv, Value};

/// Interpret up to 8 bytes as a big-endian unsigned integer
pub(crate) fn be_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// Extract the declared file size from a File Control Information structure
///
/// The FCI is a BER-TLV template (`62` FCP or `6F` FCI) whose `80`/`81` child
/// carries the file size. Absent or unparseable size information is a
/// sentinel (`None`), not an error; some card OS revisions omit it.
pub(crate) fn fci_file_size(fci: &[u8]) -> Option<usize> {
    let tlv = Tlv::from_bytes(fci).ok()?;
    let fcp = Tag::try_from(0x62u8).ok()?;
    let fci_template = Tag::try_from(0x6Fu8).ok()?;
    if tlv.tag() != &fcp && tlv.tag() != &fci_template {
        return None;
    }
    let children = match tlv.value() {
        Value::Constructed(children) => children,
        Value::Primitive(_) => return None,
    };
    let size_tags = [Tag::try_from(0x80u8).ok()?, Tag::try_from(0x81u8).ok()?];
    for child in children {
        if size_tags.contains(child.tag()) {
            if let Value::Primitive(bytes) = child.value() {
                if !bytes.is_empty() && bytes.len() <= 4 {
                    return Some(be_uint(bytes) as usize);
                }
            }
        }
    }
    None
}

/// Strip a numeric instance suffix from a reader display name
///
/// PC/SC appends `" 1"`, `" 2"` … when several readers of the same model are
/// attached; policy entries are keyed by the model name alone.
pub(crate) fn normalize_reader_name(name: &str) -> String {
    let trimmed = name.trim_end();
    if let Some((head, tail)) = trimmed.rsplit_once(' ') {
        if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
            return head.trim_end().to_string();
        }
    }
    trimmed.to_string()
}

/// Decode a hex-encoded two-byte file identifier
pub(crate) fn decode_file_id(id: &str) -> Result<Vec<u8>, crate::Error> {
    let bytes = hex::decode(id).map_err(|_| crate::Error::InvalidData("malformed file id"))?;
    if bytes.is_empty() || bytes.len() > 2 {
        return Err(crate::Error::InvalidData("file id must be one or two bytes"));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn be_uint_widths() {
        assert_eq!(be_uint(&[0x12]), 0x12);
        assert_eq!(be_uint(&[0x12, 0x34]), 0x1234);
        assert_eq!(be_uint(&[0x00, 0x01, 0x00]), 0x100);
    }

    #[test]
    fn fci_size_from_fcp_template() {
        // 62 06 80 02 05 DC 8A 00 -> FCP with size 0x05DC
        let fci = hex!("620680 0205DC 8A00");
        assert_eq!(fci_file_size(&fci), Some(0x05DC));
    }

    #[test]
    fn fci_size_absent_is_none() {
        // FCP carrying only unrelated children
        let fci = hex!("6203 8A0105");
        assert_eq!(fci_file_size(&fci), None);
        // Garbage is a sentinel too, never an error
        assert_eq!(fci_file_size(&hex!("0102")), None);
        assert_eq!(fci_file_size(&[]), None);
    }

    #[test]
    fn reader_name_normalization() {
        assert_eq!(normalize_reader_name("Gemalto PC Twin Reader 2"), "Gemalto PC Twin Reader");
        assert_eq!(normalize_reader_name("Gemalto PC Twin Reader"), "Gemalto PC Twin Reader");
        // Model names ending in digits that are part of the name keep only
        // the instance suffix stripped
        assert_eq!(normalize_reader_name("REINER SCT cyberJack 00 1"), "REINER SCT cyberJack 00");
    }

    #[test]
    fn file_id_decoding() {
        assert_eq!(decode_file_id("D001").unwrap(), vec![0xD0, 0x01]);
        assert!(decode_file_id("xyz").is_err());
        assert!(decode_file_id("A0B1C2").is_err());
    }
}
