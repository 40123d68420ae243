use rkyv::ser::serializers::AllocSerializer;
use rkyv::ser::Serializer;
use rkyv::{AlignedVec, Serialize};

/// Serializes `value` into an aligned buffer.
pub(crate) fn archive<T>(value: &T) -> AlignedVec
where
    T: Serialize<AllocSerializer<1024>>,
{
    let mut ser = AllocSerializer::<1024>::default();
    ser.serialize_value(value).unwrap();
    ser.into_serializer().into_inner()
}

/// Copies `bytes` into an aligned buffer so an archive root can be
/// validated against it. Byte slices received over the wire or read with
/// plain file I/O carry no alignment guarantee.
pub(crate) fn aligned(bytes: &[u8]) -> AlignedVec {
    let mut buf = AlignedVec::with_capacity(bytes.len());
    buf.extend_from_slice(bytes);
    buf
}
