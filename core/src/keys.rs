//! Physical key layout for meta keys and versioned data keys.
//!
//! ```text
//! meta key:  meta_prefix | name
//! data key:  data_prefix | name_len (1) | name | version (8, BE) | subkey
//! ```
//!
//! `data_prefix` is the lowercase form of `meta_prefix`. Because the length
//! byte comes first, every data key of one name sorts contiguously, ordered
//! by version and then by subkey.

use crate::error::{Error, Result};

pub const MAX_NAME_LEN: usize = u8::MAX as usize;
const VERSION_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyLayout {
    meta_prefix: u8,
    data_prefix: u8,
}

/// A decoded data key borrowing from the physical key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataKey<'a> {
    pub name: &'a [u8],
    pub version: u64,
    pub subkey: &'a [u8],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyKind<'a> {
    Meta { name: &'a [u8] },
    Data(DataKey<'a>),
    Plain,
}

impl KeyLayout {
    pub fn new(meta_prefix: u8) -> Result<Self> {
        if !meta_prefix.is_ascii_uppercase() {
            return Err(Error::invalid(format!(
                "meta prefix must be an ASCII uppercase letter, got {:#04x}",
                meta_prefix
            )));
        }
        Ok(Self {
            meta_prefix,
            data_prefix: meta_prefix.to_ascii_lowercase(),
        })
    }

    pub fn meta_prefix(&self) -> u8 {
        self.meta_prefix
    }

    pub fn data_prefix(&self) -> u8 {
        self.data_prefix
    }

    pub fn encode_meta_key(&self, name: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + name.len());
        key.push(self.meta_prefix);
        key.extend_from_slice(name);
        key
    }

    pub fn encode_data_key(&self, name: &[u8], version: u64, subkey: &[u8]) -> Result<Vec<u8>> {
        if name.len() > MAX_NAME_LEN {
            return Err(Error::invalid(format!(
                "name is {} bytes, data keys allow at most {}",
                name.len(),
                MAX_NAME_LEN
            )));
        }
        let mut key = Vec::with_capacity(2 + name.len() + VERSION_LEN + subkey.len());
        key.push(self.data_prefix);
        key.push(name.len() as u8);
        key.extend_from_slice(name);
        key.extend_from_slice(&version.to_be_bytes());
        key.extend_from_slice(subkey);
        Ok(key)
    }

    pub fn decode_data_key<'a>(&self, key: &'a [u8]) -> Result<DataKey<'a>> {
        let malformed = || Error::corruption(format!("malformed data key {:?}", key));

        let (&prefix, rest) = key.split_first().ok_or_else(malformed)?;
        if prefix != self.data_prefix {
            return Err(malformed());
        }
        let (&name_len, rest) = rest.split_first().ok_or_else(malformed)?;
        let name_len = name_len as usize;
        if rest.len() < name_len + VERSION_LEN {
            return Err(malformed());
        }
        let (name, rest) = rest.split_at(name_len);
        let (version, subkey) = rest.split_at(VERSION_LEN);
        let mut buf = [0u8; VERSION_LEN];
        buf.copy_from_slice(version);

        Ok(DataKey {
            name,
            version: u64::from_be_bytes(buf),
            subkey,
        })
    }

    /// Classify a physical key. Keys with the data prefix that do not decode
    /// are plain keys.
    pub fn classify<'a>(&self, key: &'a [u8]) -> KeyKind<'a> {
        match key.first() {
            Some(&p) if p == self.meta_prefix => KeyKind::Meta { name: &key[1..] },
            Some(&p) if p == self.data_prefix => match self.decode_data_key(key) {
                Ok(data) => KeyKind::Data(data),
                Err(_) => KeyKind::Plain,
            },
            _ => KeyKind::Plain,
        }
    }

    /// Meta key governing a data key.
    pub fn meta_key_of(&self, data: &DataKey<'_>) -> Vec<u8> {
        self.encode_meta_key(data.name)
    }
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self {
            meta_prefix: b'H',
            data_prefix: b'h',
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_key_decodes_to_its_parts() {
        let layout = KeyLayout::default();
        let key = layout.encode_data_key(b"user", 7, b"field\x00\xff").unwrap();
        assert_eq!(key[0], b'h');
        assert_eq!(key[1], 4);

        let data = layout.decode_data_key(&key).unwrap();
        assert_eq!(data.name, b"user");
        assert_eq!(data.version, 7);
        assert_eq!(data.subkey, b"field\x00\xff");
        assert_eq!(layout.meta_key_of(&data), b"Huser".to_vec());
    }

    #[test]
    fn test_long_names_are_rejected() {
        let layout = KeyLayout::default();
        assert!(layout.encode_data_key(&[b'x'; 255], 0, b"").is_ok());
        let err = layout.encode_data_key(&[b'x'; 256], 0, b"").unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_meta_prefix_must_be_uppercase() {
        assert!(KeyLayout::new(b'M').is_ok());
        assert!(KeyLayout::new(b'm').unwrap_err().is_invalid_argument());
        assert!(KeyLayout::new(b'1').unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_data_keys_of_one_name_are_contiguous() {
        let layout = KeyLayout::default();
        let mut keys = vec![
            layout.encode_data_key(b"ab", 1, b"z").unwrap(),
            layout.encode_data_key(b"a", 300, b"a").unwrap(),
            layout.encode_data_key(b"ab", 0, b"zz").unwrap(),
            layout.encode_data_key(b"a", 2, b"b").unwrap(),
            layout.encode_data_key(b"ab", 1, b"a").unwrap(),
        ];
        keys.sort();

        let decoded: Vec<_> = keys
            .iter()
            .map(|k| {
                let d = layout.decode_data_key(k).unwrap();
                (d.name.to_vec(), d.version, d.subkey.to_vec())
            })
            .collect();
        assert_eq!(
            decoded,
            vec![
                (b"a".to_vec(), 2, b"b".to_vec()),
                (b"a".to_vec(), 300, b"a".to_vec()),
                (b"ab".to_vec(), 0, b"zz".to_vec()),
                (b"ab".to_vec(), 1, b"a".to_vec()),
                (b"ab".to_vec(), 1, b"z".to_vec()),
            ]
        );
    }

    #[test]
    fn test_classify() {
        let layout = KeyLayout::default();
        assert_eq!(layout.classify(b"Hname"), KeyKind::Meta { name: b"name" });
        assert_eq!(layout.classify(b"plain"), KeyKind::Plain);
        assert_eq!(layout.classify(b""), KeyKind::Plain);
        // Data prefix but too short to hold a version.
        assert_eq!(layout.classify(b"h\x02ab\x00"), KeyKind::Plain);
        assert!(layout.decode_data_key(b"h\x02ab\x00").unwrap_err().is_corruption());

        let key = layout.encode_data_key(b"n", 3, b"s").unwrap();
        assert!(matches!(layout.classify(&key), KeyKind::Data(d) if d.version == 3));
    }
}
