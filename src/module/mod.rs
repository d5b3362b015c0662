pub mod conv_block;
pub mod dense;
pub mod leaky_relu;
