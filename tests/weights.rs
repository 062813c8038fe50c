use burn::backend::{NdArray, ndarray::NdArrayDevice};
use burn::tensor::Tensor;
use m2det::{BackboneKind, Detections, M2Det, M2DetConfig, M2DetError, Phase, build_net};
use serde_json::{Map, Value, json};

type B = NdArray<f32>;

fn small_config() -> M2DetConfig {
    M2DetConfig::new()
        .with_backbone(BackboneKind::ResNet18)
        .with_num_classes(2)
}

fn head_weights(model: &M2Det<B>) -> Vec<f32> {
    model.conf[2]
        .weight
        .val()
        .into_data()
        .to_vec::<f32>()
        .unwrap()
}

#[test]
fn mpk_weights_round_trip() {
    let device = NdArrayDevice::default();
    let dir = tempfile::tempdir().unwrap();

    let saved = M2Det::<B>::new(Phase::Train, 320, &small_config(), &device)
        .unwrap()
        .init_model();
    let path = saved.save_weights(dir.path().join("m2det")).unwrap();
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("mpk"));

    let fresh = M2Det::<B>::new(Phase::Test, 320, &small_config(), &device).unwrap();
    assert_ne!(head_weights(&fresh), head_weights(&saved));

    let loaded = fresh.load_weights(&path, &device).unwrap();
    assert_eq!(head_weights(&loaded), head_weights(&saved));
    assert_eq!(loaded.phase(), Phase::Test);
}

// Unknown extensions used to fall through to the PyTorch loader. They are now rejected up
// front, while `.pth` files still go through deserialization.
#[test]
fn unsupported_extension_is_rejected_before_reading() {
    let device = NdArrayDevice::default();
    let model = M2Det::<B>::new(Phase::Train, 320, &small_config(), &device).unwrap();

    let result = model.load_weights("weights/m2det_320.txt", &device);
    assert!(matches!(result, Err(M2DetError::UnsupportedWeightFile(_))));
}

#[test]
fn pth_extension_attempts_deserialization() {
    let device = NdArrayDevice::default();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("m2det_320.pth");
    std::fs::write(&path, b"definitely not a torch archive").unwrap();

    let model = M2Det::<B>::new(Phase::Train, 320, &small_config(), &device).unwrap();
    match model.load_weights(&path, &device) {
        Err(M2DetError::Record { path: failed, .. }) => assert_eq!(failed, path),
        Err(other) => panic!("expected a record error, got {other}"),
        Ok(_) => panic!("garbage .pth file should not load"),
    }
}

#[test]
fn build_net_from_option_mapping() {
    let device = NdArrayDevice::default();
    let options: Map<String, Value> = match json!({
        "backbone": "resnet18",
        "num_classes": 4,
        "num_levels": 8,
        "sfam": false,
    }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    };

    let model = build_net::<B>("train", 512, Some(&options), &device).unwrap();
    assert_eq!(model.size(), 512);
    assert_eq!(model.num_classes(), 4);

    let detections = model.forward(Tensor::<B, 4>::zeros([1, 3, 96, 96], &device));
    let anchors = m2det::layers::anchor_count(96);
    match detections {
        Detections::Train { loc, conf } => {
            assert_eq!(loc.dims(), [1, anchors, 4]);
            assert_eq!(conf.dims(), [1, anchors, 4]);
        }
        other => panic!("expected train detections, got {other:?}"),
    }
}

#[test]
fn default_resnet50_forward() {
    let device = NdArrayDevice::default();
    let model = build_net::<B>("test", 320, Some(&Map::new()), &device).unwrap();
    assert_eq!(model.num_classes(), 81);

    let detections = model.forward(Tensor::<B, 4>::ones([1, 3, 64, 64], &device));
    assert_eq!(detections.loc().dims(), [1, 516, 4]);
    match detections {
        Detections::Test { conf, .. } => assert_eq!(conf.dims(), [516, 81]),
        other => panic!("expected test detections, got {other:?}"),
    }
}
