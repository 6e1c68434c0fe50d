use super::*;
use candle_core::Device;

fn rows(mask: &Tensor) -> Vec<Vec<f32>> {
    mask.squeeze(0)
        .and_then(|m| m.squeeze(0))
        .and_then(|m| m.to_vec2::<f32>())
        .unwrap()
}

#[test]
fn causal_mask_respects_offsets() -> Result<()> {
    let device = Device::Cpu;
    let mask = build_causal_mask(&device, 3, 5)?;
    assert_eq!(mask.dims(), &[1, 1, 3, 5]);
    let rows = rows(&mask);

    // The earliest query sees the prefix up to offset = k_len - q_len.
    assert_eq!(rows[0][2], 0.0);
    assert_eq!(rows[0][3], f32::NEG_INFINITY);
    assert!(rows[2].iter().all(|&v| v == 0.0));
    Ok(())
}

#[test]
fn causal_mask_with_fewer_keys_hides_early_rows() -> Result<()> {
    let device = Device::Cpu;
    let rows = rows(&build_causal_mask(&device, 4, 2)?);
    assert!(rows[0].iter().all(|v| v.is_infinite()));
    assert!(rows[1].iter().all(|v| v.is_infinite()));
    assert_eq!(rows[2], vec![0.0, f32::NEG_INFINITY]);
    assert_eq!(rows[3], vec![0.0, 0.0]);
    Ok(())
}

#[test]
fn window_mask_bounds_both_sides() -> Result<()> {
    let device = Device::Cpu;
    let window_rows = rows(&build_window_mask(&device, 4, 4, WindowSize::new(1, 0))?);
    let visible: Vec<Vec<usize>> = window_rows
        .iter()
        .map(|row| (0..row.len()).filter(|&j| row[j] == 0.0).collect())
        .collect();
    assert_eq!(visible, vec![vec![0], vec![0, 1], vec![1, 2], vec![2, 3]]);

    let offset_rows = rows(&build_window_mask(&device, 2, 4, WindowSize::new(-1, 0))?);
    // offset 2: row 0 sees keys 0..=2.
    assert_eq!(offset_rows[0][2], 0.0);
    assert_eq!(offset_rows[0][3], f32::NEG_INFINITY);
    Ok(())
}

#[test]
fn window_mask_rejects_bad_sentinels() {
    let err = build_window_mask(&Device::Cpu, 2, 2, WindowSize::new(-4, 0)).unwrap_err();
    assert!(matches!(
        err,
        crate::core::AttentionError::UnsupportedConfiguration { .. }
    ));
}

#[test]
fn causal_and_window_compose() {
    let geometry = MaskGeometry::new(4, 4, true, WindowSize::new(1, 3));
    // Causality caps the right bound at the diagonal.
    assert_eq!(geometry.visible_keys(2), (1, 2));
    assert!(!geometry.is_visible(2, 3));
    assert!(!geometry.is_visible(3, 1));
}

#[test]
fn block_masking_detects_dead_blocks() {
    let geometry = MaskGeometry::new(4, 8, true, WindowSize::new(1, -1));
    // offset 4: rows see keys [3..=4], [4..=5], [5..=6], [6..=7].
    assert!(geometry.block_is_masked(&(0..2)));
    assert!(!geometry.block_is_masked(&(2..4)));
    assert!(!geometry.block_is_masked(&(6..8)));

    let unmasked = MaskGeometry::new(4, 8, false, WindowSize::UNBOUNDED);
    assert!(!unmasked.is_masking());
    assert!(!unmasked.block_is_masked(&(0..2)));
}

#[test]
fn sliced_masks_match_the_full_mask() -> Result<()> {
    let device = Device::Cpu;
    let geometry = MaskGeometry::new(3, 7, true, WindowSize::new(2, -1));
    let full = rows(&geometry.mask(0..7, &device)?);
    let tail = rows(&geometry.mask(4..7, &device)?);
    for (full_row, tail_row) in full.iter().zip(tail.iter()) {
        assert_eq!(&full_row[4..], tail_row.as_slice());
    }
    Ok(())
}

#[test]
fn alibi_follows_aligned_distance() -> Result<()> {
    let device = Device::Cpu;
    let slopes = AlibiSlopes::PerHead(vec![0.5, 2.0]);
    let bias = alibi_bias(&slopes, 1, 2, 2, 3, 0..3, &device)?;
    assert_eq!(bias.dims(), &[1, 2, 2, 3]);
    let values = bias.squeeze(0)?.to_vec3::<f32>()?;
    // offset 1: row 0 is aligned with key 1.
    for (head, slope) in [0.5f32, 2.0].iter().enumerate() {
        for row in 0..2 {
            for key in 0..3 {
                let expected = -slope * ((row as f32 + 1.0) - key as f32).abs();
                assert!((values[head][row][key] - expected).abs() < 1e-6);
            }
        }
    }
    Ok(())
}

#[test]
fn logit_bias_combines_terms() -> Result<()> {
    let device = Device::Cpu;
    let geometry = MaskGeometry::new(2, 2, true, WindowSize::UNBOUNDED);
    let slopes = AlibiSlopes::PerHead(vec![1.0]);
    let bias = LogitBias::build(&geometry, Some(&slopes), 1, 1, 0..2, &device)?;
    assert!(!bias.is_empty());
    let logits = Tensor::zeros((1, 1, 2, 2), MASK_DTYPE, &device)?;
    let out = rows(&bias.apply(&logits)?);
    assert_eq!(out[0], vec![0.0, f32::NEG_INFINITY]);
    assert_eq!(out[1], vec![-1.0, 0.0]);

    let none = LogitBias::build(
        &MaskGeometry::new(2, 2, false, WindowSize::UNBOUNDED),
        None,
        1,
        1,
        0..2,
        &device,
    )?;
    assert!(none.is_empty());
    Ok(())
}
