pub mod peripheral_sim;
