pub mod edgenpu;
