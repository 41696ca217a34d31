use std::cmp::Ordering;
use std::fmt;

use openssl::asn1::{Asn1Integer, Asn1IntegerRef};
use openssl::bn::BigNum;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

//------------ SerialNumber --------------------------------------------------

/// A certificate serial number.
///
/// Kept as unsigned big-endian bytes without leading zeros so that
/// comparing two serial numbers compares their numeric values.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct SerialNumber(Vec<u8>);

impl SerialNumber {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        SerialNumber(bytes[start..].to_vec())
    }

    pub fn from_asn1(int: &Asn1IntegerRef) -> Result<Self, openssl::error::ErrorStack> {
        Ok(Self::from_bytes(&int.to_bn()?.to_vec()))
    }

    pub fn to_asn1(&self) -> Result<Asn1Integer, openssl::error::ErrorStack> {
        BigNum::from_slice(&self.0)?.to_asn1_integer()
    }

    /// Returns the unsigned big-endian bytes, empty for zero.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        if self.0.is_empty() { "00".to_string() } else { hex::encode(&self.0) }
    }
}

impl From<u64> for SerialNumber {
    fn from(n: u64) -> Self {
        SerialNumber::from_bytes(&n.to_be_bytes())
    }
}

impl Ord for SerialNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.len().cmp(&other.0.len()).then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for SerialNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl fmt::Debug for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SerialNumber({self})")
    }
}

impl Serialize for SerialNumber {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_hex().serialize(s)
    }
}

impl<'de> Deserialize<'de> for SerialNumber {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<SerialNumber, D::Error> {
        let string = String::deserialize(d)?;
        let string = string.trim_start_matches("0x");
        let bytes = hex::decode(string).map_err(serde::de::Error::custom)?;
        Ok(SerialNumber::from_bytes(&bytes))
    }
}
