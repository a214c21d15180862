use std::fmt;
use std::ops::Index;

use crate::{RVec, ValueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ElemType {
    I1,
    I32,
    I64,
    Index,
    F32,
    F64,
}

impl ElemType {
    pub fn is_float(self) -> bool {
        matches!(self, ElemType::F32 | ElemType::F64)
    }

    pub fn is_integer(self) -> bool {
        !self.is_float()
    }

    /// Rounds `value` to what this element type can hold.
    pub fn normalize(self, value: f64) -> f64 {
        match self {
            ElemType::F32 => value as f32 as f64,
            ElemType::F64 => value,
            ElemType::I1 => (value != 0.0) as i64 as f64,
            ElemType::I32 => value.trunc() as i32 as f64,
            ElemType::I64 | ElemType::Index => value.trunc(),
        }
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ElemType::I1 => "i1",
            ElemType::I32 => "i32",
            ElemType::I64 => "i64",
            ElemType::Index => "index",
            ElemType::F32 => "f32",
            ElemType::F64 => "f64",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DimSize {
    Static(usize),
    Dynamic,
}

impl DimSize {
    pub fn as_static(self) -> Option<usize> {
        match self {
            DimSize::Static(s) => Some(s),
            DimSize::Dynamic => None,
        }
    }

    pub fn is_dynamic(self) -> bool {
        matches!(self, DimSize::Dynamic)
    }
}

impl fmt::Display for DimSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimSize::Static(s) => write!(f, "{s}"),
            DimSize::Dynamic => f.write_str("?"),
        }
    }
}

/// Shape of a tensor or buffer; dims may be dynamic.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(RVec<DimSize>);

impl Shape {
    pub fn new(dims: RVec<DimSize>) -> Self {
        Self(dims)
    }

    pub fn from_static(dims: &[usize]) -> Self {
        Self(dims.iter().map(|&d| DimSize::Static(d)).collect())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[DimSize] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = DimSize> + '_ {
        self.0.iter().copied()
    }

    pub fn is_static(&self) -> bool {
        self.0.iter().all(|d| !d.is_dynamic())
    }

    pub fn num_dynamic(&self) -> usize {
        self.0.iter().filter(|d| d.is_dynamic()).count()
    }

    /// The concrete dims, if every dim is static.
    pub fn to_static(&self) -> Option<Vec<usize>> {
        self.0.iter().map(|d| d.as_static()).collect()
    }

    pub fn numel(&self) -> Option<usize> {
        self.to_static().map(|dims| dims.iter().product())
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{self}]")
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims = self
            .0
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("x");
        f.write_str(&dims)
    }
}

impl Index<usize> for Shape {
    type Output = DimSize;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self::from_static(dims)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self::from_static(&dims)
    }
}

impl From<Vec<DimSize>> for Shape {
    fn from(dims: Vec<DimSize>) -> Self {
        Self(dims.into())
    }
}

impl FromIterator<DimSize> for Shape {
    fn from_iter<T: IntoIterator<Item = DimSize>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Marker for sparse tensor storage; tensors carrying one are left alone by
/// the rewrites that would change how their elements are laid out.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SparseEncoding {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorType {
    pub shape: Shape,
    pub elem: ElemType,
    pub encoding: Option<SparseEncoding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Layout {
    Identity,
    /// `None` marks a stride only known at runtime.
    Strided { strides: RVec<Option<i64>> },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferType {
    pub shape: Shape,
    pub elem: ElemType,
    pub layout: Layout,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Scalar(ElemType),
    Tensor(TensorType),
    Buffer(BufferType),
}

impl Type {
    pub fn tensor(shape: impl Into<Shape>, elem: ElemType) -> Self {
        Type::Tensor(TensorType {
            shape: shape.into(),
            elem,
            encoding: None,
        })
    }

    pub fn sparse_tensor(shape: impl Into<Shape>, elem: ElemType, encoding: &str) -> Self {
        Type::Tensor(TensorType {
            shape: shape.into(),
            elem,
            encoding: Some(SparseEncoding {
                name: encoding.to_string(),
            }),
        })
    }

    pub fn buffer(shape: impl Into<Shape>, elem: ElemType) -> Self {
        Type::Buffer(BufferType {
            shape: shape.into(),
            elem,
            layout: Layout::Identity,
        })
    }

    pub fn index() -> Self {
        Type::Scalar(ElemType::Index)
    }

    pub fn elem(&self) -> ElemType {
        match self {
            Type::Scalar(e) => *e,
            Type::Tensor(t) => t.elem,
            Type::Buffer(b) => b.elem,
        }
    }

    pub fn shape(&self) -> Option<&Shape> {
        match self {
            Type::Scalar(_) => None,
            Type::Tensor(t) => Some(&t.shape),
            Type::Buffer(b) => Some(&b.shape),
        }
    }

    /// Rank of a shaped type; scalars have rank 0.
    pub fn rank(&self) -> usize {
        self.shape().map(Shape::rank).unwrap_or(0)
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Type::Scalar(_))
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, Type::Tensor(_))
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self, Type::Buffer(_))
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Type::Tensor(TensorType { encoding: Some(_), .. }))
    }

    pub fn as_buffer(&self) -> Option<&BufferType> {
        match self {
            Type::Buffer(b) => Some(b),
            _ => None,
        }
    }

    /// Same kind and element type, new shape. Buffers get an identity
    /// layout.
    pub fn with_shape(&self, shape: Shape) -> Self {
        match self {
            Type::Scalar(_) | Type::Tensor(_) => Type::Tensor(TensorType {
                shape,
                elem: self.elem(),
                encoding: None,
            }),
            Type::Buffer(b) => Type::Buffer(BufferType {
                shape,
                elem: b.elem,
                layout: Layout::Identity,
            }),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = |shape: &Shape| if shape.rank() == 0 { "" } else { "x" };
        match self {
            Type::Scalar(e) => write!(f, "{e}"),
            Type::Tensor(t) => {
                write!(f, "tensor<{}{}{}", t.shape, sep(&t.shape), t.elem)?;
                if let Some(enc) = &t.encoding {
                    write!(f, ", #{}", enc.name)?;
                }
                f.write_str(">")
            }
            Type::Buffer(b) => write!(f, "memref<{}{}{}>", b.shape, sep(&b.shape), b.elem),
        }
    }
}

/// A size that is either known statically or carried by an index-typed SSA
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MixedSize {
    Static(i64),
    Value(ValueId),
}

impl MixedSize {
    pub fn as_static(self) -> Option<i64> {
        match self {
            MixedSize::Static(s) => Some(s),
            MixedSize::Value(_) => None,
        }
    }

    pub fn to_dim_size(self) -> DimSize {
        match self {
            MixedSize::Static(s) => DimSize::Static(s as usize),
            MixedSize::Value(_) => DimSize::Dynamic,
        }
    }
}

/// A loop range `offset..offset + size` walked with `stride`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub offset: MixedSize,
    pub size: MixedSize,
    pub stride: MixedSize,
}

impl Range {
    /// Offset 0, stride 1.
    pub fn is_canonical(&self) -> bool {
        self.offset == MixedSize::Static(0) && self.stride == MixedSize::Static(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_display() {
        let shape: Shape = vec![DimSize::Static(4), DimSize::Dynamic, DimSize::Static(8)].into();
        assert_eq!(format!("{shape:?}"), "[4x?x8]");
        assert_eq!(shape.num_dynamic(), 1);
        assert_eq!(shape.numel(), None);
        assert_eq!(Shape::from([2, 3]).numel(), Some(6));
    }

    #[test]
    fn type_display() {
        assert_eq!(Type::tensor([4, 8], ElemType::F32).to_string(), "tensor<4x8xf32>");
        assert_eq!(Type::tensor(Shape::default(), ElemType::F32).to_string(), "tensor<f32>");
        assert_eq!(Type::buffer([3], ElemType::I32).to_string(), "memref<3xi32>");
        assert_eq!(
            Type::sparse_tensor([3], ElemType::F64, "csr").to_string(),
            "tensor<3xf64, #csr>"
        );
    }
}
