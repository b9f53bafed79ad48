pub mod alterations;
pub mod brute;
pub mod markov;
pub mod names;
