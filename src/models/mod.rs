pub mod fpn;
pub mod m2det;
pub mod resnet;
