use anyhow::Result;
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::vae;

/// Latent scaling applied by SD3 before decoding.
pub const SCALING_FACTOR: f64 = 1.5305;
pub const SHIFT_FACTOR: f64 = 0.0609;

pub fn build_sd3_autoencoder(vb: VarBuilder) -> Result<vae::AutoEncoderKL> {
    let config = vae::AutoEncoderKLConfig {
        block_out_channels: vec![128, 256, 512, 512],
        layers_per_block: 2,
        latent_channels: 16,
        norm_num_groups: 32,
        use_quant_conv: false,
        use_post_quant_conv: false,
    };
    Ok(vae::AutoEncoderKL::new(vb, 3, 3, config)?)
}

/// Maps diffusers-style VAE weight names onto the names used inside SD3
/// single-file checkpoints.
pub fn sd3_vae_vb_rename(name: &str) -> String {
    let parts: Vec<&str> = name.split('.').collect();
    let mut result: Vec<&str> = Vec::with_capacity(parts.len());
    let mut iter = parts.iter().copied().peekable();
    let mut previous = "";

    while let Some(part) = iter.next() {
        match part {
            "down_blocks" => result.push("down"),
            "mid_block" => result.push("mid"),
            "up_blocks" => {
                result.push("up");
                // Upsampling blocks are stored in reverse order.
                match iter.next() {
                    Some("0") => result.push("3"),
                    Some("1") => result.push("2"),
                    Some("2") => result.push("1"),
                    Some("3") => result.push("0"),
                    Some(other) => result.push(other),
                    None => {}
                }
            }
            "resnets" if previous == "mid_block" => match iter.next() {
                Some("0") => result.push("block_1"),
                Some("1") => result.push("block_2"),
                Some(other) => result.push(other),
                None => {}
            },
            "resnets" => result.push("block"),
            "downsamplers" => {
                result.push("downsample");
                iter.next();
            }
            "upsamplers" => {
                result.push("upsample");
                iter.next();
            }
            "attentions" => {
                if iter.next() == Some("0") {
                    result.push("attn_1");
                }
            }
            "conv_shortcut" => result.push("nin_shortcut"),
            "group_norm" => result.push("norm"),
            "query" => result.push("q"),
            "key" => result.push("k"),
            "value" => result.push("v"),
            "proj_attn" => result.push("proj_out"),
            "conv_norm_out" => result.push("norm_out"),
            other => result.push(other),
        }
        previous = part;
    }
    result.join(".")
}
