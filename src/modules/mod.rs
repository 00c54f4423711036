//! Neural network building blocks shared by the encoder, decoder and converter.

pub mod attention;
pub mod conv_block;
pub mod position;
pub mod streaming_conv;
