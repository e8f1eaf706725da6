//! Cat vs. non-cat image classifier: a frozen EfficientNet-B0 backbone with a
//! small trainable head, trained with class-balanced binary cross-entropy and
//! early stopping, saved as a single archive.

pub mod artifact;
pub mod augmentation;
pub mod backend;
pub mod cat_model;
pub mod class_weights;
pub mod config;
pub mod data;
pub mod early_stopping;
pub mod efficientnet;
pub mod heads;
pub mod logging;
pub mod metrics;
pub mod pretrained;
pub mod training;
