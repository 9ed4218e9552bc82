use approx::assert_relative_eq;
use mirrored_rs::autograd::{self, Variable};
use mirrored_rs::data::{Batch, DataLoader, Example};
use mirrored_rs::distributed::MirroredStrategy;
use mirrored_rs::loss::{Loss, MeanSquaredError, Reduction, SparseCategoricalCrossEntropy};
use mirrored_rs::nn::{Linear, Mlp, Model, ParameterSet};
use mirrored_rs::optim::OptimizerConfig;
use mirrored_rs::tensor::{self, Tensor, TensorElem};
use mirrored_rs::train::{TrainMetrics, Trainer, TrainingConfig};
use mirrored_rs::TrainError;

/// Uses the model output itself as the per-example loss.
#[derive(Debug)]
struct OutputAsLoss;

impl<T: TensorElem + 'static> Loss<T> for OutputAsLoss {
    fn per_example(&self, predictions: &Variable<T, 2>, _targets: &Tensor<T, 2>) -> tensor::Result<Variable<T, 2>> {
        Ok(predictions.clone())
    }
}

/// Panics on any batch containing a negative target.
#[derive(Debug)]
struct PanicsOnNegativeTarget;

impl Loss<f64> for PanicsOnNegativeTarget {
    fn per_example(&self, predictions: &Variable<f64, 2>, targets: &Tensor<f64, 2>) -> tensor::Result<Variable<f64, 2>> {
        assert!(targets.data().iter().all(|&t| t >= 0.0), "negative target");
        MeanSquaredError.per_example(predictions, targets)
    }
}

fn classification_data(n: usize) -> Vec<Example<f64>> {
    (0..n)
        .map(|i| {
            let x = i as f64 / n as f64;
            let class = usize::from(x > 0.5) as f64;
            Example::new(vec![x, 1.0 - x, (i % 3) as f64 * 0.1], vec![class])
        })
        .collect()
}

fn classifier(replicas: usize, per_replica: usize) -> Trainer<f64, Mlp, SparseCategoricalCrossEntropy> {
    let model = Mlp::new(&[3, 5, 2]).unwrap();
    let params = model.init_parameters::<f64>(42).unwrap();
    let config = TrainingConfig::new(1)
        .with_replicas(replicas)
        .with_batch_size(per_replica)
        .with_optimizer(OptimizerConfig::sgd(0.1).with_momentum(0.9))
        .without_shuffle();
    Trainer::new(model, params, SparseCategoricalCrossEntropy, config).unwrap()
}

fn assert_params_close(a: &ParameterSet<f64>, b: &ParameterSet<f64>) {
    assert_eq!(a.names(), b.names());
    for (x, y) in a.tensors().iter().zip(b.tensors()) {
        for (p, q) in x.data().iter().zip(y.data()) {
            assert_relative_eq!(p, q, epsilon = 1e-12, max_relative = 1e-10);
        }
    }
}

#[test]
fn test_replica_count_does_not_change_the_update() {
    let batch = classification_data(8);
    let mut single = classifier(1, 8);
    let mut mirrored = classifier(4, 2);

    for _ in 0..3 {
        let a = single.train_step(&batch).unwrap();
        let b = mirrored.train_step(&batch).unwrap();
        assert_relative_eq!(a.loss, b.loss, epsilon = 1e-12);
        assert_eq!(a.correct, b.correct);
    }
    assert_params_close(single.parameters(), mirrored.parameters());
    assert!(mirrored.replicas_in_sync());
}

#[test]
fn test_uneven_split_losses_sum_to_the_mean() {
    let batch = classification_data(7);
    let mut single = classifier(1, 7);
    let mut mirrored = classifier(3, 3);

    assert_eq!(
        mirrored.strategy().split_batch(&batch).iter().map(|s| s.len()).collect::<Vec<_>>(),
        vec![3, 2, 2]
    );
    let a = single.train_step(&batch).unwrap();
    let b = mirrored.train_step(&batch).unwrap();
    assert_relative_eq!(a.loss, b.loss, epsilon = 1e-12);
    assert_params_close(single.parameters(), mirrored.parameters());
}

#[test]
fn test_batch_smaller_than_replica_count() {
    let batch = classification_data(2);
    let mut single = classifier(1, 2);
    let mut mirrored = classifier(4, 1);

    let a = single.train_step(&batch).unwrap();
    let b = mirrored.train_step(&batch).unwrap();
    assert_relative_eq!(a.loss, b.loss, epsilon = 1e-12);
    assert_eq!(b.examples, 2);
    assert_params_close(single.parameters(), mirrored.parameters());
}

#[test]
fn test_single_replica_matches_a_plain_step() {
    let batch = classification_data(6);
    let mut trainer = classifier(1, 6);

    let model = Mlp::new(&[3, 5, 2]).unwrap();
    let mut params = model.init_parameters::<f64>(42).unwrap();
    let mut optimizer = OptimizerConfig::sgd(0.1).with_momentum(0.9).build::<f64>().unwrap();

    for _ in 0..2 {
        let collated = Batch::collate(&batch).unwrap();
        let leaves = params.to_variables();
        let logits = model.forward(&leaves, &Variable::new(collated.inputs)).unwrap();
        let per_example = SparseCategoricalCrossEntropy
            .per_example(&logits, &collated.targets)
            .unwrap();
        let loss = Reduction::Mean.apply(&per_example).unwrap();
        let grads = autograd::grad(&loss, &leaves).unwrap();
        optimizer.apply_gradients(&mut params, &grads).unwrap();

        let out = trainer.train_step(&batch).unwrap();
        assert_eq!(out.loss, loss.data.sum());
    }
    assert_eq!(trainer.parameters(), &params);
}

#[test]
fn test_partial_losses_scale_by_global_batch() {
    // w = 1, b = 0, so each example's loss is its feature.
    let mut params = ParameterSet::new();
    params.push("id.weight", Tensor::new(vec![1.0], [1, 1]).unwrap()).unwrap();
    params.push("id.bias", Tensor::new(vec![0.0], [1, 1]).unwrap()).unwrap();
    let config = TrainingConfig::new(1).with_replicas(2).with_batch_size(2);
    let mut trainer = Trainer::new(Linear::new("id", 1, 1), params, OutputAsLoss, config).unwrap();

    let batch: Vec<Example<f64>> = [2.0, 3.0, 4.0, 5.0]
        .into_iter()
        .map(|x| Example::new(vec![x], vec![0.0]))
        .collect();
    let shards = trainer.strategy().split_batch(&batch);
    let partials: Vec<f64> = trainer
        .replicas()
        .iter()
        .zip(&shards)
        .map(|(r, shard)| {
            r.compute_local(shard, &OutputAsLoss, Reduction::SumOverGlobalBatch(4))
                .unwrap()
                .loss
        })
        .collect();
    assert_eq!(partials, vec![1.25, 2.25]);

    let out = trainer.train_step(&batch).unwrap();
    assert_eq!(out.loss, 3.5);
}

#[test]
fn test_local_reductions_are_rejected() {
    let trainer = classifier(2, 2);
    let batch = classification_data(2);
    for reduction in [Reduction::Mean, Reduction::None] {
        let err = trainer.replicas()[0]
            .compute_local(&batch, &SparseCategoricalCrossEntropy, reduction)
            .unwrap_err();
        assert!(matches!(err, TrainError::InvalidConfig(_)));
    }
}

#[test]
fn test_zero_replicas_rejected_before_training() {
    assert!(matches!(
        MirroredStrategy::builder().num_replicas(0).build(),
        Err(TrainError::InvalidConfig(_))
    ));

    let model = Mlp::new(&[3, 2]).unwrap();
    let params = model.init_parameters::<f64>(0).unwrap();
    let config = TrainingConfig::new(1).with_replicas(0);
    let err = Trainer::new(model, params, SparseCategoricalCrossEntropy, config).unwrap_err();
    assert!(matches!(err, TrainError::InvalidConfig(_)));
}

#[test]
fn test_resuming_a_stream_continues_the_step_count() {
    let data = classification_data(12);
    let mut metrics = TrainMetrics::standard();

    let mut resumed = classifier(2, 2);
    let loader = DataLoader::new(data.clone(), 4);
    let mut stream = loader.stream(true);
    let first = resumed.run_steps(&mut stream, 10, &mut metrics).unwrap();
    let second = resumed.run_steps(&mut stream, 10, &mut metrics).unwrap();
    assert_eq!(first.len(), 10);
    assert_eq!(second[0].step, 11);
    assert_eq!(second.last().unwrap().step, 20);
    assert_eq!(stream.position().batches, 20);

    let mut straight = classifier(2, 2);
    let all = straight
        .run_steps(&mut DataLoader::new(data, 4).stream(true), 20, &mut TrainMetrics::new())
        .unwrap();
    assert_eq!(all.len(), 20);
    assert_eq!(straight.parameters(), resumed.parameters());
}

#[test]
fn test_non_repeating_stream_runs_fewer_steps() {
    let mut trainer = classifier(2, 2);
    let loader = DataLoader::new(classification_data(10), 4);
    let outputs = trainer
        .run_steps(&mut loader.stream(false), 10, &mut TrainMetrics::new())
        .unwrap();
    assert_eq!(outputs.len(), 3);
    assert_eq!(outputs[2].examples, 2);
}

#[test]
fn test_nan_in_one_replica_aborts_the_step() {
    let mut trainer = classifier(2, 2);
    let mut metrics = TrainMetrics::standard();
    let before = trainer.parameters().clone();

    let mut batch = classification_data(4);
    batch[3].features[0] = f64::NAN;
    let err = trainer.train_step(&batch).unwrap_err();
    assert!(matches!(err, TrainError::NonFinite { step: 1, replica: 1 }), "{err}");

    assert_eq!(trainer.parameters(), &before);
    assert!(trainer.replicas_in_sync());
    assert_eq!(trainer.step(), 0);

    // Nothing is wedged: the next healthy step goes through.
    let out = trainer
        .run_steps(&mut std::iter::once(classification_data(4)), 1, &mut metrics)
        .unwrap();
    assert_eq!(out[0].step, 1);
    assert_ne!(trainer.parameters(), &before);
}

#[test]
fn test_panicking_replica_aborts_the_step() {
    let model = Mlp::new(&[3, 1]).unwrap();
    let params = model.init_parameters::<f64>(1).unwrap();
    let config = TrainingConfig::new(1).with_replicas(3).with_batch_size(1);
    let mut trainer = Trainer::new(model, params, PanicsOnNegativeTarget, config).unwrap();
    let before = trainer.parameters().clone();

    let mut batch = classification_data(3);
    batch[0].target[0] = -1.0;
    let err = trainer.train_step(&batch).unwrap_err();
    assert!(matches!(err, TrainError::ReplicaPanicked(0)), "{err}");
    assert_eq!(trainer.parameters(), &before);

    assert!(trainer.train_step(&classification_data(3)).is_ok());
}

#[test]
fn test_classifier_learns() {
    let mut trainer = classifier(4, 4);
    let data = classification_data(32);
    let loader = DataLoader::new(data.clone(), 16);
    let before = trainer.evaluate(&loader).unwrap();

    let mut metrics = TrainMetrics::standard();
    let mut stream = loader.stream(true);
    trainer.run_steps(&mut stream, 60, &mut metrics).unwrap();

    let after = trainer.evaluate(&loader).unwrap();
    assert_eq!(after.examples, 32);
    assert!(after.loss < before.loss, "{} !< {}", after.loss, before.loss);
    assert!(trainer.replicas_in_sync());
}
