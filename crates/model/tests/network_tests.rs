use anyhow::Result;
use attention::AttentionKind;
use candle_core::{Device, Tensor};
use model::{nlnet18, nlnet50, NetworkConfig, NonLocalNet, UnitKind, DEFAULT_ATTENTION_PERIODS};

fn attention_norm_names() -> [&'static str; 4] {
    ["bn.weight", "bn.bias", "ln.weight", "ln.bias"]
}

#[test]
fn attention_insertion_follows_the_period() -> Result<()> {
    let mut config = NetworkConfig::new(UnitKind::Basic, [1, 6, 1, 1], 4);
    config.stages[1].attention = AttentionKind::non_local();
    config.stages[1].attention_period = 2;
    let network = NonLocalNet::new(config)?;

    let stage = network.stage(1);
    let attention_positions: Vec<usize> = stage
        .iter()
        .enumerate()
        .filter(|(_, entry)| entry.is_attention())
        .map(|(idx, _)| idx)
        .collect();

    // Six units with period 2: blocks land immediately after units 1, 3, 5.
    assert_eq!(stage.len(), 9);
    assert_eq!(attention_positions, vec![2, 5, 8]);
    Ok(())
}

#[test]
fn oversized_period_inserts_nothing() -> Result<()> {
    let mut config = NetworkConfig::new(UnitKind::Basic, [2, 2, 2, 2], 4);
    config.stages[3].attention = AttentionKind::global_context();
    config.stages[3].attention_period = 1000;
    let network = NonLocalNet::new(config)?;
    assert!(network.stage(3).iter().all(|entry| !entry.is_attention()));
    Ok(())
}

#[test]
fn bottleneck_network_produces_logits_end_to_end() -> Result<()> {
    let config = nlnet50(10).with_attention(AttentionKind::non_local(), DEFAULT_ATTENTION_PERIODS);
    let network = NonLocalNet::new(config)?;
    let images = Tensor::zeros((2, 3, 224, 224), candle_core::DType::F32, &Device::Cpu)?;
    let logits = network.forward(&images, false)?;
    assert_eq!(logits.dims(), &[2, 10]);
    Ok(())
}

#[test]
fn identical_seed_yields_bit_identical_parameters() -> Result<()> {
    let build = || -> Result<Vec<(String, Vec<f32>)>> {
        let config = nlnet18(4)
            .with_attention(AttentionKind::non_local(), [2, 2, 1000])
            .with_seed(42);
        let network = NonLocalNet::new(config)?;
        let mut out = Vec::new();
        for (name, var) in network.parameters() {
            out.push((name, var.as_tensor().flatten_all()?.to_vec1::<f32>()?));
        }
        Ok(out)
    };

    let first = build()?;
    let second = build()?;
    assert_eq!(first.len(), second.len());
    for ((name_a, values_a), (name_b, values_b)) in first.iter().zip(second.iter()) {
        assert_eq!(name_a, name_b);
        assert_eq!(values_a, values_b, "parameter {name_a} differs across builds");
    }
    Ok(())
}

#[test]
fn attention_norms_start_at_zero_and_backbone_norms_at_one() -> Result<()> {
    for kind in [
        AttentionKind::non_local(),
        AttentionKind::Bat {
            reduction: 2,
            grid: 4,
            heads: 4,
            dropout: 0.2,
        },
        AttentionKind::global_context(),
    ] {
        let config = nlnet18(4).with_attention(kind, [2, 1000, 1000]);
        let network = NonLocalNet::new(config)?;

        let mut saw_attention_norm = false;
        for (name, var) in network.parameters() {
            let values = var.as_tensor().flatten_all()?.to_vec1::<f32>()?;
            if name.contains(".att") && attention_norm_names().iter().any(|s| name.ends_with(s)) {
                saw_attention_norm = true;
                assert!(
                    values.iter().all(|v| *v == 0.0),
                    "{name} should be zero-initialized for {}",
                    kind.label()
                );
            }
            if name == "bn1.weight" {
                assert!(values.iter().all(|v| *v == 1.0), "stem norm scale clobbered");
            }
        }
        assert!(saw_attention_norm, "no attention norms found for {}", kind.label());
    }
    Ok(())
}

#[test]
fn assembled_attention_blocks_are_identity_at_initialization() -> Result<()> {
    for kind in [
        AttentionKind::non_local(),
        AttentionKind::Bat {
            reduction: 2,
            grid: 4,
            heads: 4,
            dropout: 0.2,
        },
        AttentionKind::global_context(),
    ] {
        let config = nlnet18(4).with_attention(kind, [1, 1000, 1000]);
        let network = NonLocalNet::new(config)?;

        // Stage 2 of the basic variant runs at 128 channels.
        let features = Tensor::randn(0f32, 1.0, (1, 128, 8, 8), &Device::Cpu)?;
        let mut probed = 0;
        for entry in network.stage(1) {
            if let model::StageEntry::Attention(block) = entry {
                let refined = block.forward(&features, false)?;
                let diff = refined.sub(&features)?.abs()?.max_all()?.to_vec0::<f32>()?;
                assert!(
                    diff < 1e-5,
                    "{} block changed its input by {diff} at init",
                    kind.label()
                );
                probed += 1;
            }
        }
        assert!(probed > 0);
    }
    Ok(())
}

#[test]
fn zero_init_last_norm_applies_to_every_unit() -> Result<()> {
    let config = nlnet50(4).with_zero_init_last_norm(true);
    let network = NonLocalNet::new(config)?;
    for (name, var) in network.parameters() {
        if name.ends_with("bn3.weight") {
            let values = var.as_tensor().flatten_all()?.to_vec1::<f32>()?;
            assert!(values.iter().all(|v| *v == 0.0), "{name} not zeroed");
        }
    }
    Ok(())
}

#[test]
fn channel_gate_parameters_exist_only_when_enabled() -> Result<()> {
    let gated = NonLocalNet::new(nlnet50(4).with_channel_gate(true))?;
    assert!(gated
        .parameters()
        .iter()
        .any(|(name, _)| name.contains(".se.")));

    let plain = NonLocalNet::new(nlnet50(4))?;
    assert!(plain
        .parameters()
        .iter()
        .all(|(name, _)| !name.contains(".se.")));
    Ok(())
}

#[test]
fn basic_units_reject_grouped_configuration() {
    let config = nlnet18(4).with_groups(32, 4);
    assert!(NonLocalNet::new(config).is_err());
}

#[test]
fn zero_attention_period_is_a_configuration_error() {
    let mut config = nlnet18(4);
    config.stages[1].attention = AttentionKind::non_local();
    config.stages[1].attention_period = 0;
    assert!(NonLocalNet::new(config).is_err());
}

#[test]
fn grouped_bottleneck_variant_builds() -> Result<()> {
    let config = model::nlnext50_32x4d(4);
    let network = NonLocalNet::new(config)?;
    let images = Tensor::zeros((1, 3, 64, 64), candle_core::DType::F32, &Device::Cpu)?;
    let logits = network.forward(&images, false)?;
    assert_eq!(logits.dims(), &[1, 4]);
    Ok(())
}
