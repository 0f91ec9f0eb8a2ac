//! 1-D array wire codec and the `ToParams` batch-insert explosion rule.

use crate::error::{Error, Result};
use crate::protocol::types::{Oid, oid};

use super::{FromWireValue, ToWireValue};

/// Marks a type as usable as the element of a generic array parameter
/// (`Vec<T>` binding/decoding as a single PostgreSQL array value).
///
/// `u8` is deliberately excluded: `Vec<u8>` already has its own `ToWireValue`
/// impl treating it as `bytea`, a scalar type, not an array of integers.
/// `String`/`&str` are excluded too: `Vec<String>`/`Vec<&str>` explode into
/// one bind parameter per element instead (see `BindArg` below) rather than
/// serializing as a single array value.
pub trait ArrayElement: ToWireValue {
    /// The scalar OID this type encodes to, independent of any particular
    /// value. Needed to pick an array OID even when the `Vec` is empty.
    fn element_oid() -> Oid;
}

macro_rules! impl_array_element {
    ($t:ty, $oid:expr) => {
        impl ArrayElement for $t {
            fn element_oid() -> Oid {
                $oid
            }
        }
    };
}

impl_array_element!(bool, oid::BOOL);
impl_array_element!(i16, oid::INT2);
impl_array_element!(i32, oid::INT4);
impl_array_element!(i64, oid::INT8);
impl_array_element!(f32, oid::FLOAT4);
impl_array_element!(f64, oid::FLOAT8);
impl_array_element!(Vec<u8>, oid::BYTEA);

#[cfg(feature = "with-uuid")]
impl_array_element!(uuid::Uuid, oid::UUID);
#[cfg(feature = "with-rust-decimal")]
impl_array_element!(rust_decimal::Decimal, oid::NUMERIC);
#[cfg(feature = "with-chrono")]
impl_array_element!(chrono::NaiveDate, oid::DATE);
#[cfg(feature = "with-chrono")]
impl_array_element!(chrono::NaiveTime, oid::TIME);
#[cfg(feature = "with-chrono")]
impl_array_element!(chrono::NaiveDateTime, oid::TIMESTAMP);
#[cfg(feature = "with-chrono")]
impl_array_element!(chrono::DateTime<chrono::Utc>, oid::TIMESTAMPTZ);
#[cfg(feature = "with-time")]
impl_array_element!(time::Date, oid::DATE);
#[cfg(feature = "with-time")]
impl_array_element!(time::Time, oid::TIME);
#[cfg(feature = "with-time")]
impl_array_element!(time::PrimitiveDateTime, oid::TIMESTAMP);
#[cfg(feature = "with-time")]
impl_array_element!(time::OffsetDateTime, oid::TIMESTAMPTZ);

impl<T: ArrayElement> ToWireValue for Vec<T> {
    fn natural_oid(&self) -> Oid {
        oid::array_oid_for_element(T::element_oid()).unwrap_or(0)
    }

    fn encode(&self, target_oid: Oid, buf: &mut Vec<u8>) -> Result<()> {
        let natural = self.natural_oid();
        if target_oid != natural {
            return Err(Error::type_mismatch(natural, target_oid));
        }

        let len_pos = buf.len();
        buf.extend_from_slice(&0_i32.to_be_bytes()); // length, patched below
        let body_start = buf.len();

        buf.extend_from_slice(&1_i32.to_be_bytes()); // ndim
        buf.extend_from_slice(&0_i32.to_be_bytes()); // has-nulls: Vec<T> elements are never NULL
        buf.extend_from_slice(&(T::element_oid() as i32).to_be_bytes());
        let dim_size: i32 = self
            .len()
            .try_into()
            .map_err(|_| Error::Decode("array too long to encode".into()))?;
        buf.extend_from_slice(&dim_size.to_be_bytes());
        buf.extend_from_slice(&1_i32.to_be_bytes()); // lower bound

        for elem in self {
            elem.encode(T::element_oid(), buf)?;
        }

        let body_len = (buf.len() - body_start) as i32;
        buf[len_pos..len_pos + 4].copy_from_slice(&body_len.to_be_bytes());
        Ok(())
    }
}

impl<'a, T: FromWireValue<'a>> FromWireValue<'a> for Vec<T> {
    fn from_text(oid: Oid, _bytes: &'a [u8]) -> Result<Self> {
        Err(Error::Unsupported(format!(
            "array decode from text format (oid {oid})"
        )))
    }

    fn from_binary(_oid: Oid, bytes: &'a [u8]) -> Result<Self> {
        let header: [u8; 4] = bytes[0..4]
            .try_into()
            .map_err(|_| Error::Decode("truncated array header".into()))?;
        let ndim = i32::from_be_bytes(header);
        if ndim == 0 {
            return Ok(Vec::new());
        }
        if ndim != 1 {
            return Err(Error::Decode(format!(
                "only 1-D arrays are supported, got {ndim} dimensions"
            )));
        }

        let has_nulls = i32::from_be_bytes(
            bytes[4..8]
                .try_into()
                .map_err(|_| Error::Decode("truncated array header".into()))?,
        );
        let element_oid = i32::from_be_bytes(
            bytes[8..12]
                .try_into()
                .map_err(|_| Error::Decode("truncated array header".into()))?,
        ) as Oid;
        let dim_size = i32::from_be_bytes(
            bytes[12..16]
                .try_into()
                .map_err(|_| Error::Decode("truncated array header".into()))?,
        );
        // bytes[16..20] is the lower bound; 1-D arrays only need it accepted, not used.

        let mut pos = 20usize;
        let mut out = Vec::with_capacity(dim_size.max(0) as usize);
        for _ in 0..dim_size {
            let elem_len_bytes: [u8; 4] = bytes
                .get(pos..pos + 4)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| Error::Decode("truncated array element length".into()))?;
            let elem_len = i32::from_be_bytes(elem_len_bytes);
            pos += 4;

            if elem_len < 0 {
                if has_nulls == 0 {
                    return Err(Error::Decode(
                        "array element is NULL but has-nulls flag is unset".into(),
                    ));
                }
                out.push(T::from_null()?);
                continue;
            }

            let elem_bytes = bytes
                .get(pos..pos + elem_len as usize)
                .ok_or_else(|| Error::Decode("truncated array element data".into()))?;
            out.push(T::from_binary(element_oid, elem_bytes)?);
            pos += elem_len as usize;
        }
        Ok(out)
    }
}

/// Per-argument binding contract underlying `ToParams`'s tuple impls.
///
/// Every ordinary value binds as exactly one parameter. `Vec<String>` and
/// `Vec<&str>` are the exception: the batch-insert idiom explodes a sequence
/// of strings into one parameter per element rather than a single array
/// value (`Vec<Vec<u8>>` and every other `Vec<T>` still bind as one array
/// parameter, via the blanket impl below).
pub trait BindArg {
    /// Number of wire parameters this argument contributes.
    fn arg_count(&self) -> usize;
    /// Append this argument's natural OID(s), in order, to `oids`.
    fn push_natural_oids(&self, oids: &mut Vec<Oid>);
    /// Encode this argument's parameter(s) against the matching slice of
    /// `target_oids` (length `arg_count()`).
    fn encode_args(&self, target_oids: &[Oid], buf: &mut Vec<u8>) -> Result<()>;
}

impl<T: ToWireValue> BindArg for T {
    fn arg_count(&self) -> usize {
        1
    }

    fn push_natural_oids(&self, oids: &mut Vec<Oid>) {
        oids.push(self.natural_oid());
    }

    fn encode_args(&self, target_oids: &[Oid], buf: &mut Vec<u8>) -> Result<()> {
        self.encode(target_oids[0], buf)
    }
}

impl BindArg for Vec<String> {
    fn arg_count(&self) -> usize {
        self.len()
    }

    fn push_natural_oids(&self, oids: &mut Vec<Oid>) {
        oids.extend(std::iter::repeat_n(oid::TEXT, self.len()));
    }

    fn encode_args(&self, target_oids: &[Oid], buf: &mut Vec<u8>) -> Result<()> {
        for (s, &t) in self.iter().zip(target_oids) {
            s.encode(t, buf)?;
        }
        Ok(())
    }
}

impl BindArg for Vec<&str> {
    fn arg_count(&self) -> usize {
        self.len()
    }

    fn push_natural_oids(&self, oids: &mut Vec<Oid>) {
        oids.extend(std::iter::repeat_n(oid::TEXT, self.len()));
    }

    fn encode_args(&self, target_oids: &[Oid], buf: &mut Vec<u8>) -> Result<()> {
        for (s, &t) in self.iter().zip(target_oids) {
            s.encode(t, buf)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_of_i32_round_trips() {
        let values = vec![1_i32, 2, 3];
        let mut buf = Vec::new();
        values.encode(oid::INT4ARRAY, &mut buf).unwrap();

        // Length prefix + body
        let len = i32::from_be_bytes(buf[0..4].try_into().unwrap());
        assert_eq!(len as usize, buf.len() - 4);

        let decoded: Vec<i32> = Vec::from_binary(oid::INT4ARRAY, &buf[4..]).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn empty_array_round_trips() {
        let values: Vec<i32> = vec![];
        let mut buf = Vec::new();
        values.encode(oid::INT4ARRAY, &mut buf).unwrap();

        let decoded: Vec<i32> = Vec::from_binary(oid::INT4ARRAY, &buf[4..]).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn array_natural_oid_matches_element_type() {
        assert_eq!(Vec::<i32>::new().natural_oid(), oid::INT4ARRAY);
        assert_eq!(Vec::<bool>::new().natural_oid(), oid::BOOLARRAY);
    }

    #[test]
    fn array_rejects_mismatched_target_oid() {
        let values = vec![1_i32];
        let mut buf = Vec::new();
        assert!(values.encode(oid::TEXTARRAY, &mut buf).is_err());
    }

    #[test]
    fn vec_u8_stays_bytea_not_an_array_of_int() {
        // Vec<u8> keeps its bespoke bytea ToWireValue impl (conversion::bytes),
        // it does not go through the generic Vec<T: ArrayElement> array codec.
        let bytes = vec![1_u8, 2, 3];
        let mut buf = Vec::new();
        ToWireValue::encode(&bytes, oid::BYTEA, &mut buf).unwrap();
        assert_eq!(&buf[0..4], &3_i32.to_be_bytes());
        assert_eq!(&buf[4..], &[1, 2, 3]);
    }

    #[test]
    fn string_vec_explodes_into_one_arg_per_element() {
        let values = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(BindArg::arg_count(&values), 3);

        let mut oids = Vec::new();
        BindArg::push_natural_oids(&values, &mut oids);
        assert_eq!(oids, vec![oid::TEXT, oid::TEXT, oid::TEXT]);
    }

    #[test]
    fn plain_scalar_binds_as_single_arg() {
        assert_eq!(BindArg::arg_count(&42_i32), 1);
        assert_eq!(BindArg::arg_count(&vec![1_i32, 2, 3]), 1);
        assert_eq!(BindArg::arg_count(&vec![vec![1_u8], vec![2_u8]]), 1);
    }
}
