use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::{flux, mmdit::model::MMDiT};
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

const LATENT_CHANNELS: usize = 16;

/// Gaussian noise in the MMDiT latent layout for an image of `height` x `width`.
///
/// candle cannot seed its CPU generator, so seeded CPU noise is drawn on the
/// host. Accelerators are seeded in place.
pub fn initial_noise(
    height: usize,
    width: usize,
    seed: Option<u64>,
    device: &Device,
) -> Result<Tensor> {
    match seed {
        Some(seed) if device.is_cpu() => {
            let shape = (
                1,
                LATENT_CHANNELS,
                height.div_ceil(16) * 2,
                width.div_ceil(16) * 2,
            );
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            let len = shape.1 * shape.2 * shape.3;
            let values: Vec<f32> = StandardNormal.sample_iter(&mut rng).take(len).collect();
            Ok(Tensor::from_vec(values, shape, &Device::Cpu)?.to_device(device)?)
        }
        Some(seed) => {
            device.set_seed(seed)?;
            Ok(flux::sampling::get_noise(1, height, width, device)?)
        }
        None => Ok(flux::sampling::get_noise(1, height, width, device)?),
    }
}

/// Flow-matching Euler sampler with classifier-free guidance.
///
/// `y` and `context` hold the conditional batch first and the unconditional
/// batch second.
#[allow(clippy::too_many_arguments)]
pub fn euler_sample(
    mmdit: &MMDiT,
    y: &Tensor,
    context: &Tensor,
    num_inference_steps: usize,
    cfg_scale: f64,
    time_shift: f64,
    height: usize,
    width: usize,
    seed: Option<u64>,
    dtype: DType,
) -> Result<Tensor> {
    let mut x = initial_noise(height, width, seed, y.device())?.to_dtype(dtype)?;
    let sigmas = sigmas(num_inference_steps, time_shift);

    for (step, window) in sigmas.windows(2).enumerate() {
        let (s_curr, s_prev) = match window {
            [a, b] => (*a, *b),
            _ => continue,
        };
        let timestep = s_curr * 1000.0;
        let noise_pred = mmdit.forward(
            &Tensor::cat(&[&x, &x], 0)?,
            &Tensor::full(timestep as f32, (2,), x.device())?.contiguous()?,
            y,
            context,
            None,
        )?;
        let guided = apply_cfg(cfg_scale, &noise_pred)?;
        x = (x + guided.affine(s_prev - s_curr, 0.)?)?;
        tracing::debug!("denoising step {}/{num_inference_steps}", step + 1);
    }
    Ok(x)
}

/// Noise levels from 1 down to 0, shifted towards the noisy end.
fn sigmas(num_inference_steps: usize, time_shift: f64) -> Vec<f64> {
    (0..=num_inference_steps)
        .map(|step| step as f64 / num_inference_steps as f64)
        .rev()
        .map(|t| time_snr_shift(time_shift, t))
        .collect()
}

fn time_snr_shift(alpha: f64, t: f64) -> f64 {
    alpha * t / (1.0 + (alpha - 1.0) * t)
}

fn apply_cfg(cfg_scale: f64, noise_pred: &Tensor) -> Result<Tensor> {
    let cond = noise_pred.narrow(0, 0, 1)?;
    let uncond = noise_pred.narrow(0, 1, 1)?;
    Ok((cond.affine(cfg_scale, 0.)? - uncond.affine(cfg_scale - 1.0, 0.)?)?)
}
