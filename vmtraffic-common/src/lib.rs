//! vmtraffic common library
pub mod delta;
pub mod model;
pub mod timekey;

#[cfg(test)]
mod test;
