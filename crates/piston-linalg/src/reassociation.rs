//! Reassociation groups: how the dims of an expanded shape fold into the
//! dims of a collapsed one.

use crate::{BufferType, DimSize, Layout, RVec, Shape};

/// Contiguous run of expanded dims folding into one collapsed dim.
pub type ReassociationIndices = RVec<usize>;

/// Groups are non-empty, contiguous, ordered, and cover `0..expanded`
/// exactly once; there is one group per collapsed dim. A rank-0 side allows
/// an empty reassociation over unit dims.
pub fn is_valid_reassociation(
    reassociation: &[ReassociationIndices],
    collapsed: usize,
    expanded: usize,
) -> bool {
    if collapsed == 0 {
        return reassociation.is_empty();
    }
    if reassociation.len() != collapsed {
        return false;
    }
    let mut next = 0;
    for group in reassociation {
        if group.is_empty() {
            return false;
        }
        for &d in group {
            if d != next {
                return false;
            }
            next += 1;
        }
    }
    next == expanded
}

/// Shape obtained by folding each group into one dim.
pub fn collapsed_shape(expanded: &Shape, reassociation: &[ReassociationIndices]) -> Shape {
    reassociation
        .iter()
        .map(|group| {
            group.iter().try_fold(1usize, |acc, &d| match expanded[d] {
                DimSize::Static(s) => Some(acc * s),
                DimSize::Dynamic => None,
            })
        })
        .map(|size| size.map_or(DimSize::Dynamic, DimSize::Static))
        .collect()
}

/// Checks that `expanded` can be folded into `collapsed` along
/// `reassociation`. Returns a reason on mismatch.
pub fn reshape_like_shapes_are_compatible(
    collapsed: &Shape,
    expanded: &Shape,
    reassociation: &[ReassociationIndices],
) -> Result<(), String> {
    if !is_valid_reassociation(reassociation, collapsed.rank(), expanded.rank()) {
        return Err(format!(
            "invalid reassociation {reassociation:?} from {expanded:?} to {collapsed:?}"
        ));
    }
    for (i, group) in reassociation.iter().enumerate() {
        let dynamic = group.iter().filter(|&&d| expanded[d].is_dynamic()).count();
        match collapsed[i] {
            DimSize::Dynamic if dynamic == 0 => {
                return Err(format!(
                    "collapsed dim {i} is dynamic but expanded dims {group:?} are all static"
                ));
            }
            DimSize::Static(_) if dynamic > 0 => {
                return Err(format!(
                    "collapsed dim {i} is static but expanded dims {group:?} contain a dynamic dim"
                ));
            }
            DimSize::Static(size) => {
                let product = group
                    .iter()
                    .filter_map(|&d| expanded[d].as_static())
                    .product::<usize>();
                if product != size {
                    return Err(format!(
                        "collapsed dim {i} of size {size} does not match the product {product} of {group:?}"
                    ));
                }
            }
            DimSize::Dynamic => {}
        }
    }
    Ok(())
}

/// A buffer group can be collapsed without copying when, inside every group,
/// each dim's stride equals the next dim's stride times its size.
pub fn is_guaranteed_collapsible(buffer: &BufferType, reassociation: &[ReassociationIndices]) -> bool {
    let strides = match &buffer.layout {
        Layout::Identity => return true,
        Layout::Strided { strides } => strides,
    };
    reassociation.iter().all(|group| {
        group.windows(2).all(|pair| {
            let (outer, inner) = (pair[0], pair[1]);
            match (
                strides[outer],
                strides[inner],
                buffer.shape[inner].as_static(),
            ) {
                (Some(outer_stride), Some(inner_stride), Some(inner_size)) => {
                    outer_stride == inner_stride * inner_size as i64
                }
                _ => false,
            }
        })
    })
}

/// Reassociation folding the dims of a rank-`rank` shape into one.
pub fn fully_collapsed_reassociation(rank: usize) -> Vec<ReassociationIndices> {
    if rank == 0 {
        return vec![];
    }
    vec![(0..rank).collect()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ElemType;

    fn group(dims: &[usize]) -> ReassociationIndices {
        dims.iter().copied().collect()
    }

    #[test]
    fn validity() {
        assert!(is_valid_reassociation(&[group(&[0, 1]), group(&[2])], 2, 3));
        assert!(!is_valid_reassociation(&[group(&[0, 2]), group(&[1])], 2, 3));
        assert!(!is_valid_reassociation(&[group(&[0])], 1, 2));
        assert!(is_valid_reassociation(&[], 0, 2));
    }

    #[test]
    fn collapse_shapes() {
        let shape: Shape = vec![DimSize::Static(4), DimSize::Static(8), DimSize::Dynamic].into();
        let collapsed = collapsed_shape(&shape, &[group(&[0, 1]), group(&[2])]);
        assert_eq!(collapsed, vec![DimSize::Static(32), DimSize::Dynamic].into());
        let all = collapsed_shape(&shape, &fully_collapsed_reassociation(3));
        assert_eq!(all, vec![DimSize::Dynamic].into());
    }

    #[test]
    fn compatibility() {
        let reassociation = [group(&[0, 1])];
        let expanded = Shape::from([4, 8]);
        assert!(reshape_like_shapes_are_compatible(&Shape::from([32]), &expanded, &reassociation).is_ok());
        assert!(reshape_like_shapes_are_compatible(&Shape::from([30]), &expanded, &reassociation).is_err());
        let dynamic: Shape = vec![DimSize::Dynamic].into();
        assert!(reshape_like_shapes_are_compatible(&dynamic, &expanded, &reassociation).is_err());
    }

    #[test]
    fn strided_buffers() {
        let contiguous = BufferType {
            shape: Shape::from([4, 8]),
            elem: ElemType::F32,
            layout: Layout::Strided {
                strides: rvec![Some(8), Some(1)],
            },
        };
        assert!(is_guaranteed_collapsible(&contiguous, &[group(&[0, 1])]));
        let padded = BufferType {
            layout: Layout::Strided {
                strides: rvec![Some(16), Some(1)],
            },
            ..contiguous.clone()
        };
        assert!(!is_guaranteed_collapsible(&padded, &[group(&[0, 1])]));
        assert!(is_guaranteed_collapsible(&padded, &[group(&[0]), group(&[1])]));
        let unknown = BufferType {
            layout: Layout::Strided {
                strides: rvec![None, Some(1)],
            },
            ..contiguous
        };
        assert!(!is_guaranteed_collapsible(&unknown, &[group(&[0, 1])]));
    }
}
