pub mod netznoe;
