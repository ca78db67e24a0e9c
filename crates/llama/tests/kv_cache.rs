mod common;

use candle_core::{DType, Device, Tensor};
use llama::attention::{CacheLayout, CacheSpec, KvCache, dequantize, quantize};

use common::{assert_close, max_abs_diff};

fn spec(layout: CacheLayout, quant_bit: usize) -> CacheSpec {
    CacheSpec {
        num_layers: 3,
        max_batch: 2,
        max_seq_len: 8,
        num_kv_heads: 2,
        head_dim: 8,
        layout,
        quant_bit,
        quant_group: 4,
    }
}

const LAYOUTS: [CacheLayout; 4] = [
    CacheLayout::BatchMajor,
    CacheLayout::LayerMajor,
    CacheLayout::LayerHeadMajor,
    CacheLayout::BatchHeadMajor,
];

fn randn(shape: &[usize]) -> Tensor {
    Tensor::randn(0f32, 1f32, shape, &Device::Cpu).unwrap()
}

#[test]
fn storage_shapes_follow_layout() {
    let expected = [
        vec![2, 3, 2, 8, 2, 8],
        vec![3, 2, 2, 8, 2, 8],
        vec![3, 2, 2, 2, 8, 8],
        vec![2, 3, 2, 2, 8, 8],
    ];
    for (layout, shape) in LAYOUTS.iter().zip(expected) {
        let cache = KvCache::new(spec(*layout, 0), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(cache.data().dims(), shape.as_slice());
        assert!(cache.scale().is_none());
        assert_eq!(CacheLayout::from_index(layout.index()).unwrap(), *layout);
    }
    assert!(CacheLayout::from_index(4).is_err());

    let quantized = KvCache::new(spec(CacheLayout::LayerHeadMajor, 8), DType::F32, &Device::Cpu)
        .unwrap();
    assert_eq!(quantized.data().dtype(), DType::U8);
    assert_eq!(quantized.scale().unwrap().dims(), &[3, 2, 2, 2, 8, 2]);
}

#[test]
fn every_layout_round_trips_stored_positions() {
    for layout in LAYOUTS {
        let mut cache = KvCache::new(spec(layout, 0), DType::F32, &Device::Cpu).unwrap();
        let k0 = randn(&[2, 3, 2, 8]);
        let v0 = randn(&[2, 3, 2, 8]);
        let k1 = randn(&[2, 2, 2, 8]);
        let v1 = randn(&[2, 2, 2, 8]);
        cache.store(1, 0, &k0, &v0).unwrap();
        cache.store(1, 3, &k1, &v1).unwrap();

        let (keys, values) = cache.load(1, 2, 5).unwrap();
        assert_eq!(keys.dims(), &[2, 5, 2, 8]);
        assert_close(&keys.narrow(1, 0, 3).unwrap(), &k0, 0.0);
        assert_close(&keys.narrow(1, 3, 2).unwrap(), &k1, 0.0);
        assert_close(&values.narrow(1, 0, 3).unwrap(), &v0, 0.0);
        assert_close(&values.narrow(1, 3, 2).unwrap(), &v1, 0.0);

        // other layers stay untouched
        let (other, _) = cache.load(0, 2, 5).unwrap();
        assert_eq!(max_abs_diff(&other, &other.zeros_like().unwrap()), 0.0);
    }
}

#[test]
fn smaller_batch_only_touches_leading_rows() {
    let mut cache =
        KvCache::new(spec(CacheLayout::BatchMajor, 0), DType::F32, &Device::Cpu).unwrap();
    let k = randn(&[1, 2, 2, 8]);
    cache.store(2, 0, &k, &k).unwrap();
    let (keys, _) = cache.load(2, 2, 2).unwrap();
    assert_close(&keys.narrow(0, 0, 1).unwrap(), &k, 0.0);
    let second = keys.narrow(0, 1, 1).unwrap();
    assert_eq!(max_abs_diff(&second, &second.zeros_like().unwrap()), 0.0);
}

#[test]
fn out_of_range_writes_are_rejected() {
    let mut cache =
        KvCache::new(spec(CacheLayout::LayerMajor, 0), DType::F32, &Device::Cpu).unwrap();
    let k = randn(&[1, 2, 2, 8]);
    assert!(cache.store(3, 0, &k, &k).is_err());
    assert!(cache.store(0, 7, &k, &k).is_err());
    assert!(cache.store(0, 0, &randn(&[3, 2, 2, 8]), &randn(&[3, 2, 2, 8])).is_err());
    assert!(cache.store(0, 0, &randn(&[1, 2, 1, 8]), &randn(&[1, 2, 1, 8])).is_err());
    assert!(cache.load(0, 1, 9).is_err());
}

#[test]
fn quantized_cache_error_is_bounded_by_group_scale() {
    for layout in LAYOUTS {
        let mut cache = KvCache::new(spec(layout, 8), DType::F32, &Device::Cpu).unwrap();
        let k = randn(&[2, 4, 2, 8]);
        let v = randn(&[2, 4, 2, 8]);
        cache.store(0, 2, &k, &v).unwrap();
        let (keys, values) = cache.load(0, 2, 6).unwrap();
        let keys = keys.narrow(1, 2, 4).unwrap();
        let values = values.narrow(1, 2, 4).unwrap();
        // |x| <= absmax, so the rounding error is at most absmax / 254
        let bound = |x: &Tensor| {
            x.abs().unwrap().flatten_all().unwrap().max(0).unwrap().to_scalar::<f32>().unwrap()
                / 254.0
                + 1e-6
        };
        assert!(max_abs_diff(&keys, &k) <= bound(&k));
        assert!(max_abs_diff(&values, &v) <= bound(&v));
    }
}

#[test]
fn quantize_uses_per_group_absmax() {
    let x = Tensor::new(&[[1f32, -2., 0.5, 0.], [0.1, 0.2, 0.3, -0.4]], &Device::Cpu).unwrap();
    let (q, scale) = quantize(&x, 4).unwrap();
    assert_eq!(q.dtype(), DType::U8);
    let scale = scale.to_vec2::<f32>().unwrap();
    assert!((scale[0][0] - 2.0 / 127.0).abs() < 1e-7);
    assert!((scale[1][0] - 0.4 / 127.0).abs() < 1e-7);
    let q = q.to_vec2::<u8>().unwrap();
    assert_eq!(q[0][1], 128 - 127);
    assert_eq!(q[0][3], 128);
    assert_eq!(q[1][3], 128 - 127);

    let scale = Tensor::new(&[[2f32 / 127.0], [0.4 / 127.0]], &Device::Cpu).unwrap();
    let (q, _) = quantize(&x, 4).unwrap();
    let restored = dequantize(&q, &scale, 4).unwrap();
    assert!(max_abs_diff(&restored, &x) < 2.0 / 254.0 + 1e-6);
    assert!(quantize(&x, 3).is_err());
}

#[test]
fn all_zero_group_survives_quantization() {
    let x = Tensor::zeros((1, 8), DType::F32, &Device::Cpu).unwrap();
    let (q, scale) = quantize(&x, 8).unwrap();
    let restored = dequantize(&q, &scale, 8).unwrap();
    assert_eq!(restored.to_vec2::<f32>().unwrap(), vec![vec![0f32; 8]]);
}

#[test]
fn stores_write_into_the_preallocated_storage() {
    for layout in LAYOUTS {
        let mut cache = KvCache::new(spec(layout, 0), DType::F32, &Device::Cpu).unwrap();
        let storage = cache.data().clone();
        let k = randn(&[2, 1, 2, 8]);
        let v = randn(&[2, 1, 2, 8]);
        cache.store(2, 5, &k, &v).unwrap();
        // the handle taken before the store sees the new values
        assert_eq!(max_abs_diff(&storage, cache.data()), 0.0);
        assert!(max_abs_diff(&storage, &storage.zeros_like().unwrap()) > 0.0);
    }

    let mut quantized =
        KvCache::new(spec(CacheLayout::LayerHeadMajor, 8), DType::F32, &Device::Cpu).unwrap();
    let scale = quantized.scale().unwrap().clone();
    let k = randn(&[1, 1, 2, 8]);
    quantized.store(0, 0, &k, &k).unwrap();
    assert!(max_abs_diff(&scale, &scale.zeros_like().unwrap()) > 0.0);
}

#[test]
fn loaded_tensors_do_not_follow_later_stores() {
    for layout in LAYOUTS {
        let mut cache = KvCache::new(spec(layout, 0), DType::F32, &Device::Cpu).unwrap();
        let k0 = randn(&[2, 3, 2, 8]);
        cache.store(0, 0, &k0, &k0).unwrap();
        let (keys, _) = cache.load(0, 2, 3).unwrap();
        cache.store(0, 0, &randn(&[2, 3, 2, 8]), &randn(&[2, 3, 2, 8])).unwrap();
        assert_close(&keys, &k0, 0.0);
    }
}

#[test]
fn decode_writes_leave_neighbouring_positions_intact() {
    for layout in LAYOUTS {
        let mut cache = KvCache::new(spec(layout, 0), DType::F32, &Device::Cpu).unwrap();
        let prefix = randn(&[2, 4, 2, 8]);
        cache.store(1, 0, &prefix, &prefix).unwrap();
        let mut expected = vec![prefix.clone()];
        for pos in 4..8 {
            let step = randn(&[2, 1, 2, 8]);
            cache.store(1, pos, &step, &step).unwrap();
            expected.push(step);
        }
        let expected = Tensor::cat(&expected, 1).unwrap();
        let (keys, values) = cache.load(1, 2, 8).unwrap();
        assert_close(&keys, &expected, 0.0);
        assert_close(&values, &expected, 0.0);
        let (other, _) = cache.load(2, 2, 8).unwrap();
        assert_eq!(max_abs_diff(&other, &other.zeros_like().unwrap()), 0.0);
    }
}
