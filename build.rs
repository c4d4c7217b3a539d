use shadow_rs::ShadowBuilder;
fn main() {
    ShadowBuilder::builder().build().unwrap();
}
