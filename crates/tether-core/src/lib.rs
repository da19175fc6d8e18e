#![deny(unsafe_code)]
#![doc = r#"
# tether-core

## 模块使命（Why）
- **统一异步原语**：为网络协议栈、客户端与服务端组件提供一组不依赖具体描述符类型的基础契约：
  调度上下文、协作式取消票据、线程安全观察者集合，以及按块推进的字节管道；
- **结果投递可控**：所有异步结果都经调用方指定的 [`dispatch::DispatchContext`] 派发，
  调用方据此决定回调运行在哪个线程、是否串行。

## 核心契约（What）
- [`dispatch`]：`DirectContext`、`SerialContext`、`ConcurrentContext`、`ThreadContext` 四种派发纪律；
- [`cancel`]：一次性取消票据，支持超时、链接与回调；
- [`observer`]：按上下文投递的多播观察者集合；
- [`pipe`]：部分完成、多次回调的读写端点与对称管道；
- [`error`]：稳定错误码的管道、套接字与服务层错误分类；
- [`reactor`] 与 [`config`]：Tokio 运行时句柄的获取与调优。

## 实现策略（How）
- I/O 进展由 Tokio 反应器驱动，回调经 `DispatchContext::perform` 交付；
- 锁只保护登记表与状态位，所有用户回调都在锁外执行。

## 风险提示（Trade-offs）
- 回调派发到非串行上下文时，同一请求的多个事件可能乱序到达；需要顺序的调用方应选择串行上下文。
"#]

pub mod cancel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod observer;
pub mod pipe;
pub mod prelude;
pub mod reactor;
