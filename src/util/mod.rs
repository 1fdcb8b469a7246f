pub mod shape;
pub mod vec3;
