macro_rules! translator_tests {
    ($i:ident) => {
    };
}
