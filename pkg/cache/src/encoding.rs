use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use std::io::Write;

/// Wire format of a cached payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Json,
    Yaml,
}

impl Format {
    /// Pick a format from an `Accept` header. JSON unless YAML is asked for.
    pub fn from_accept(accept: Option<&str>) -> Self {
        match accept {
            Some(value) if value.contains("yaml") => Format::Yaml,
            _ => Format::Json,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Format::Json => "application/json",
            Format::Yaml => "application/yaml",
        }
    }
}

/// Content encoding of a cached payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Identity,
    Gzip,
}

impl Encoding {
    /// Pick an encoding from an `Accept-Encoding` header.
    pub fn from_accept_encoding(accept_encoding: Option<&str>) -> Self {
        match accept_encoding {
            Some(value)
                if value
                    .split(',')
                    .any(|part| part.trim().split(';').next() == Some("gzip")) =>
            {
                Encoding::Gzip
            }
            _ => Encoding::Identity,
        }
    }

    pub fn header_value(self) -> Option<&'static str> {
        match self {
            Encoding::Identity => None,
            Encoding::Gzip => Some("gzip"),
        }
    }
}

/// An encoded response body, cheap to clone.
#[derive(Debug, Clone)]
pub struct Payload {
    pub body: Bytes,
    pub format: Format,
    pub encoding: Encoding,
    /// Registry version of the snapshot it was rendered from.
    pub version: u64,
}

pub fn encode<T: Serialize>(
    value: &T,
    format: Format,
    encoding: Encoding,
    version: u64,
) -> anyhow::Result<Payload> {
    let raw = match format {
        Format::Json => serde_json::to_vec(value)?,
        Format::Yaml => serde_yaml::to_string(value)?.into_bytes(),
    };
    let body = match encoding {
        Encoding::Identity => raw,
        Encoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&raw)?;
            encoder.finish()?
        }
    };
    Ok(Payload {
        body: Bytes::from(body),
        format,
        encoding,
        version,
    })
}
