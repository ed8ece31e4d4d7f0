use super::schema::RecordKeys;
use super::{Dataset, Example};
use crate::error::{CtrError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use prost::Message;
use proto::feature::Kind;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

const MASK_DELTA: u32 = 0xa282ead8;

/// `tf.train.Example` and the messages it is built from
pub mod proto {
    use std::collections::HashMap;

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct BytesList {
        #[prost(bytes = "vec", repeated, tag = "1")]
        pub value: Vec<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct FloatList {
        #[prost(float, repeated, tag = "1")]
        pub value: Vec<f32>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Int64List {
        #[prost(int64, repeated, tag = "1")]
        pub value: Vec<i64>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Feature {
        #[prost(oneof = "feature::Kind", tags = "1, 2, 3")]
        pub kind: Option<feature::Kind>,
    }

    pub mod feature {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Kind {
            #[prost(message, tag = "1")]
            BytesList(super::BytesList),
            #[prost(message, tag = "2")]
            FloatList(super::FloatList),
            #[prost(message, tag = "3")]
            Int64List(super::Int64List),
        }
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Features {
        #[prost(map = "string, message", tag = "1")]
        pub feature: HashMap<String, Feature>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Example {
        #[prost(message, optional, tag = "1")]
        pub features: Option<Features>,
    }
}

/// Masked CRC-32C as stored in TFRecord headers and footers
pub fn masked_crc32c(data: &[u8]) -> u32 {
    let crc = crc32c::crc32c(data);
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// Split a TFRecord file into its payloads, verifying both checksums.
/// Each record is framed as
/// `u64 length | u32 masked crc32c(length) | payload | u32 masked crc32c(payload)`,
/// all little endian
pub fn read_records(bytes: &[u8]) -> Result<Vec<&[u8]>> {
    let mut cursor = Cursor::new(bytes);
    let mut records = vec![];

    while (cursor.position() as usize) < bytes.len() {
        let start = cursor.position() as usize;
        let length = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| CtrError::TfRecord(format!("truncated length at offset {}", start)))?;
        let length_crc = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| CtrError::TfRecord(format!("truncated header at offset {}", start)))?;

        if masked_crc32c(&bytes[start..start + 8]) != length_crc {
            return Err(CtrError::TfRecord(format!(
                "length checksum mismatch at offset {}",
                start
            )));
        }

        let data_start = cursor.position() as usize;
        let data_end = data_start
            .checked_add(length as usize)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| CtrError::TfRecord(format!("truncated record at offset {}", start)))?;
        cursor.set_position(data_end as u64);

        let data_crc = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| CtrError::TfRecord(format!("missing data checksum at offset {}", start)))?;
        let payload = &bytes[data_start..data_end];

        if masked_crc32c(payload) != data_crc {
            return Err(CtrError::TfRecord(format!(
                "data checksum mismatch at offset {}",
                start
            )));
        }

        records.push(payload);
    }

    Ok(records)
}

/// Decode a serialized `tf.train.Example` into its feature map
pub fn decode_example(payload: &[u8]) -> std::result::Result<HashMap<String, proto::Feature>, String> {
    let example = proto::Example::decode(payload).map_err(|e| e.to_string())?;
    Ok(example.features.map(|f| f.feature).unwrap_or_default())
}

fn kind<'a>(features: &'a HashMap<String, proto::Feature>, key: &str) -> Option<&'a Kind> {
    features.get(key).and_then(|feature| feature.kind.as_ref())
}

/// Turn a decoded example into a training example
fn to_example(
    features: &HashMap<String, proto::Feature>,
    keys: &RecordKeys,
    feature_size: usize,
) -> std::result::Result<Example, String> {
    let feat_ids = match kind(features, &keys.ids) {
        Some(Kind::Int64List(ids)) => ids
            .value
            .iter()
            .map(|&id| {
                usize::try_from(id)
                    .ok()
                    .filter(|id| *id < feature_size)
                    .ok_or_else(|| format!("feature id {} out of range", id))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?,
        _ => return Err(format!("missing int64 feature '{}'", keys.ids)),
    };

    let feat_vals = match kind(features, &keys.vals) {
        Some(Kind::FloatList(vals)) if vals.value.len() == feat_ids.len() => {
            vals.value.iter().map(|x| *x as f64).collect()
        }
        Some(_) => return Err(format!("'{}' does not match '{}'", keys.vals, keys.ids)),
        None => vec![1f64; feat_ids.len()],
    };

    let label = match kind(features, &keys.label) {
        Some(Kind::Int64List(v)) if v.value.len() == 1 => v.value[0] as f64,
        Some(Kind::FloatList(v)) if v.value.len() == 1 => v.value[0] as f64,
        _ => return Err(format!("missing scalar label '{}'", keys.label)),
    };

    Ok(Example {
        feat_ids,
        feat_vals,
        label: if label == 1f64 { 1f64 } else { 0f64 },
    })
}

/// Parse a TFRecord file of `tf.train.Example`s
pub fn parse_dataset(path: &Path, keys: &RecordKeys, feature_size: usize) -> Result<Dataset> {
    let mut bytes = vec![];
    fs::File::open(path)?.read_to_end(&mut bytes)?;

    let records = read_records(&bytes)?;
    let examples = records
        .par_iter()
        .enumerate()
        .map(|(idx, record)| {
            decode_example(record)
                .and_then(|features| to_example(&features, keys, feature_size))
                .map_err(|message| CtrError::Parse {
                    path: path.display().to_string(),
                    line: idx + 1,
                    message,
                })
        })
        .collect::<Result<Vec<Example>>>()?;

    Ok(Dataset::from_examples(examples))
}
