pub mod candle_aux_layers;
pub mod candle_decoder_multihead;
pub mod candle_encoder_gaussian;
pub mod candle_encoder_multihead;
pub mod candle_encoding;
pub mod candle_loss_functions;
pub mod candle_model_traits;

pub use candle_core;
pub use candle_nn;
